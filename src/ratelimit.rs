//! Token-bucket rate limiting across three dimensions: global, per-user and
//! per-model. Buckets refill continuously at the configured per-minute rate;
//! capacity is the per-minute rate plus the burst allowance. A tier's
//! `rate_limit_multiplier` scales the user bucket.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::{GatewayError, GatewayResult};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rpm: u32, burst: u32) -> Self {
        let capacity = (rpm + burst) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: rpm as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn scaled(rpm: u32, burst: u32, multiplier: f64) -> Self {
        let multiplier = multiplier.max(0.0);
        let capacity = ((rpm + burst) as f64 * multiplier).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: (rpm as f64 / 60.0) * multiplier,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter over all three dimensions. One instance per gateway.
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<Bucket>,
    user_buckets: DashMap<String, Bucket>,
    model_buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = Bucket::new(config.global_rpm, config.burst_allowance);
        Self {
            config,
            global: Mutex::new(global),
            user_buckets: DashMap::new(),
            model_buckets: DashMap::new(),
        }
    }

    /// Admission check for the global and per-user buckets. The tier
    /// multiplier only shapes the bucket on first sight of the user.
    pub fn check_request(&self, user_id: &str, tier_multiplier: f64) -> GatewayResult<()> {
        if !self.global.lock().expect("rate limiter poisoned").try_take() {
            debug!("global rate bucket empty");
            return Err(GatewayError::RateLimited {
                scope: "global".into(),
            });
        }

        let mut bucket = self
            .user_buckets
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Bucket::scaled(
                    self.config.per_user_rpm,
                    self.config.burst_allowance,
                    tier_multiplier,
                )
            });
        if !bucket.try_take() {
            debug!(user_id, "user rate bucket empty");
            return Err(GatewayError::RateLimited {
                scope: format!("user:{user_id}"),
            });
        }

        Ok(())
    }

    /// Admission check for the selected model's bucket.
    pub fn check_model(&self, model_id: &str, rpm: u32) -> GatewayResult<()> {
        let mut bucket = self
            .model_buckets
            .entry(model_id.to_string())
            .or_insert_with(|| Bucket::new(rpm, self.config.burst_allowance));
        if !bucket.try_take() {
            debug!(model_id, "model rate bucket empty");
            return Err(GatewayError::RateLimited {
                scope: format!("model:{model_id}"),
            });
        }
        Ok(())
    }
}
