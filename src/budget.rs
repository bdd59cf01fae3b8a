//! Budget enforcement and tracking.
//!
//! Each configured budget gets a usage entry with a rolling period window.
//! Admission compares projected usage against the limit; recording adds the
//! actual cost under a per-budget lock and reports which alert thresholds
//! were crossed so the gateway can emit alert events. A built-in global
//! ceiling applies even when no budget is configured.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BudgetConfig;
use crate::{GatewayError, GatewayResult};

/// Default ceiling for the built-in global budget, USD.
pub const DEFAULT_GLOBAL_LIMIT: f64 = 10_000.0;

const BUILTIN_GLOBAL_ID: &str = "global";

/// Budget health, derived from the usage fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Active,
    Warning,
    Exceeded,
}

/// Alert event emitted when usage crosses a configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub budget_id: String,
    pub threshold: f64,
    pub current_usage: f64,
    pub limit: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BudgetUsage {
    current_usage: f64,
    limit: f64,
    auto_disable: bool,
    period: Option<crate::config::ResetPeriod>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    status: BudgetStatus,
    alert_thresholds: Vec<f64>,
    fired_thresholds: Vec<f64>,
}

impl BudgetUsage {
    fn for_config(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        Self {
            current_usage: 0.0,
            limit: config.total_budget,
            auto_disable: config.auto_disable_at_limit,
            period: Some(config.reset_period),
            period_start: now,
            period_end: config.reset_period.period_end(now),
            status: BudgetStatus::Active,
            alert_thresholds: config.alert_thresholds.clone(),
            fired_thresholds: Vec::new(),
        }
    }

    fn builtin_global(limit: f64, now: DateTime<Utc>) -> Self {
        Self {
            current_usage: 0.0,
            limit,
            auto_disable: true,
            period: None,
            period_start: now,
            period_end: DateTime::<Utc>::MAX_UTC,
            status: BudgetStatus::Active,
            alert_thresholds: Vec::new(),
            fired_thresholds: Vec::new(),
        }
    }

    /// Rolls the window forward if the period has ended.
    fn roll_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        let Some(period) = self.period else {
            return false;
        };
        if now < self.period_end {
            return false;
        }
        while self.period_end <= now {
            self.period_start = self.period_end;
            self.period_end = period.period_end(self.period_start);
        }
        self.current_usage = 0.0;
        self.status = BudgetStatus::Active;
        self.fired_thresholds.clear();
        true
    }

    fn refresh_status(&mut self) {
        let fraction = self.current_usage / self.limit;
        self.status = if fraction >= 1.0 {
            BudgetStatus::Exceeded
        } else if fraction >= 0.9 {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Active
        };
    }
}

/// Per-budget usage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub budget_id: String,
    pub current_usage: f64,
    pub limit: f64,
    pub usage_fraction: f64,
    pub status: BudgetStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub days_remaining: i64,
}

/// Tracks usage against configured budgets plus the built-in global ceiling.
pub struct BudgetTracker {
    usage: DashMap<String, Mutex<BudgetUsage>>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::with_global_limit(DEFAULT_GLOBAL_LIMIT)
    }

    pub fn with_global_limit(limit: f64) -> Self {
        let usage = DashMap::new();
        usage.insert(
            BUILTIN_GLOBAL_ID.to_string(),
            Mutex::new(BudgetUsage::builtin_global(limit, Utc::now())),
        );
        Self { usage }
    }

    fn ensure_entry(&self, config: &BudgetConfig) {
        self.usage
            .entry(config.budget_id.clone())
            .or_insert_with(|| Mutex::new(BudgetUsage::for_config(config, Utc::now())));
    }

    /// Denies the request if any applicable budget (or the built-in global
    /// ceiling) would be exceeded by the estimated cost.
    pub fn admit(&self, budgets: &[BudgetConfig], estimated_cost: f64) -> GatewayResult<()> {
        let now = Utc::now();

        for config in budgets {
            self.ensure_entry(config);
            let entry = self.usage.get(&config.budget_id).expect("entry ensured");
            let mut usage = entry.lock().expect("budget lock poisoned");
            usage.roll_if_expired(now);

            if usage.auto_disable && usage.status == BudgetStatus::Exceeded {
                warn!(budget_id = %config.budget_id, "budget disabled at limit");
                return Err(GatewayError::BudgetExceeded {
                    budget_id: config.budget_id.clone(),
                    current_usage: usage.current_usage,
                    limit: usage.limit,
                    resets_at: usage.period_end,
                });
            }

            if usage.current_usage + estimated_cost > usage.limit {
                warn!(
                    budget_id = %config.budget_id,
                    current = usage.current_usage,
                    estimated = estimated_cost,
                    limit = usage.limit,
                    "budget admission denied"
                );
                return Err(GatewayError::BudgetExceeded {
                    budget_id: config.budget_id.clone(),
                    current_usage: usage.current_usage,
                    limit: usage.limit,
                    resets_at: usage.period_end,
                });
            }
        }

        // Built-in global ceiling.
        let entry = self.usage.get(BUILTIN_GLOBAL_ID).expect("global entry");
        let usage = entry.lock().expect("budget lock poisoned");
        if usage.current_usage + estimated_cost > usage.limit {
            warn!("built-in global budget exhausted");
            return Err(GatewayError::BudgetExceeded {
                budget_id: BUILTIN_GLOBAL_ID.into(),
                current_usage: usage.current_usage,
                limit: usage.limit,
                resets_at: usage.period_end,
            });
        }

        Ok(())
    }

    /// Records actual cost against every applicable budget and the built-in
    /// global ceiling. Returns alert events for newly crossed thresholds.
    pub fn record(&self, budgets: &[BudgetConfig], actual_cost: f64) -> Vec<BudgetAlert> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        for config in budgets {
            self.ensure_entry(config);
            let entry = self.usage.get(&config.budget_id).expect("entry ensured");
            let mut usage = entry.lock().expect("budget lock poisoned");
            usage.roll_if_expired(now);

            let before_fraction = usage.current_usage / usage.limit;
            usage.current_usage += actual_cost;
            usage.refresh_status();
            let after_fraction = usage.current_usage / usage.limit;

            let thresholds = usage.alert_thresholds.clone();
            for threshold in thresholds {
                let already_fired = usage.fired_thresholds.contains(&threshold);
                if !already_fired && before_fraction < threshold && after_fraction >= threshold {
                    usage.fired_thresholds.push(threshold);
                    alerts.push(BudgetAlert {
                        budget_id: config.budget_id.clone(),
                        threshold,
                        current_usage: usage.current_usage,
                        limit: usage.limit,
                        timestamp: now,
                    });
                }
            }
            debug!(
                budget_id = %config.budget_id,
                cost = actual_cost,
                usage = usage.current_usage,
                "recorded budget usage"
            );
        }

        let entry = self.usage.get(BUILTIN_GLOBAL_ID).expect("global entry");
        let mut usage = entry.lock().expect("budget lock poisoned");
        usage.current_usage += actual_cost;
        usage.refresh_status();

        alerts
    }

    /// Rolls every expired budget window. Run periodically.
    pub fn reset_expired(&self) -> usize {
        let now = Utc::now();
        let mut reset = 0;
        for entry in self.usage.iter() {
            let mut usage = entry.value().lock().expect("budget lock poisoned");
            if usage.roll_if_expired(now) {
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, "reset expired budget periods");
        }
        reset
    }

    pub fn summary(&self, budget_id: &str) -> Option<BudgetSummary> {
        let entry = self.usage.get(budget_id)?;
        let usage = entry.lock().expect("budget lock poisoned");
        Some(BudgetSummary {
            budget_id: budget_id.to_string(),
            current_usage: usage.current_usage,
            limit: usage.limit,
            usage_fraction: usage.current_usage / usage.limit,
            status: usage.status,
            period_start: usage.period_start,
            period_end: usage.period_end,
            days_remaining: (usage.period_end - Utc::now()).num_days(),
        })
    }

    pub fn global_summary(&self) -> BudgetSummary {
        self.summary(BUILTIN_GLOBAL_ID)
            .expect("built-in global budget always exists")
    }

    #[cfg(test)]
    pub(crate) fn seed_usage(&self, config: &BudgetConfig, amount: f64) {
        self.ensure_entry(config);
        let entry = self.usage.get(&config.budget_id).expect("entry ensured");
        let mut usage = entry.lock().expect("budget lock poisoned");
        usage.current_usage = amount;
        usage.refresh_status();
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResetPeriod;

    fn budget(id: &str, limit: f64) -> BudgetConfig {
        BudgetConfig {
            budget_id: id.into(),
            name: id.into(),
            total_budget: limit,
            reset_period: ResetPeriod::Daily,
            alert_thresholds: vec![0.5, 0.8],
            auto_disable_at_limit: true,
            user_groups: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn denies_when_projection_exceeds_limit() {
        let tracker = BudgetTracker::new();
        let config = budget("b1", 1.0);
        tracker.seed_usage(&config, 0.99);

        let err = tracker.admit(&[config.clone()], 0.02).unwrap_err();
        match err {
            GatewayError::BudgetExceeded {
                budget_id,
                current_usage,
                limit,
                ..
            } => {
                assert_eq!(budget_id, "b1");
                assert!((current_usage - 0.99).abs() < 1e-9);
                assert!((limit - 1.0).abs() < 1e-9);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }

        // A request that still fits is admitted.
        assert!(tracker.admit(&[config], 0.005).is_ok());
    }

    #[test]
    fn auto_disable_blocks_after_limit() {
        let tracker = BudgetTracker::new();
        let config = budget("b1", 1.0);
        tracker.record(&[config.clone()], 1.0);
        assert!(tracker.admit(&[config], 0.0).is_err());
    }

    #[test]
    fn alerts_fire_once_per_threshold() {
        let tracker = BudgetTracker::new();
        let config = budget("b1", 1.0);

        let alerts = tracker.record(&[config.clone()], 0.55);
        assert_eq!(alerts.len(), 1);
        assert!((alerts[0].threshold - 0.5).abs() < 1e-9);

        // Crossing 0.8 fires the next threshold; 0.5 is not re-fired.
        let alerts = tracker.record(&[config.clone()], 0.3);
        assert_eq!(alerts.len(), 1);
        assert!((alerts[0].threshold - 0.8).abs() < 1e-9);

        let alerts = tracker.record(&[config], 0.05);
        assert!(alerts.is_empty());
    }

    #[test]
    fn status_tracks_usage_fraction() {
        let tracker = BudgetTracker::new();
        let config = budget("b1", 1.0);

        tracker.record(&[config.clone()], 0.5);
        assert_eq!(tracker.summary("b1").unwrap().status, BudgetStatus::Active);

        tracker.record(&[config.clone()], 0.42);
        assert_eq!(tracker.summary("b1").unwrap().status, BudgetStatus::Warning);

        tracker.record(&[config], 0.1);
        assert_eq!(
            tracker.summary("b1").unwrap().status,
            BudgetStatus::Exceeded
        );
    }

    #[test]
    fn builtin_global_ceiling_applies_without_configured_budgets() {
        let tracker = BudgetTracker::with_global_limit(1.0);
        assert!(tracker.admit(&[], 0.5).is_ok());
        tracker.record(&[], 0.9);
        let err = tracker.admit(&[], 0.2).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded { budget_id, .. } if budget_id == "global"
        ));
    }

    #[test]
    fn recording_charges_every_applicable_budget() {
        let tracker = BudgetTracker::new();
        let narrow = budget("narrow", 10.0);
        let global = budget("global_cfg", 100.0);

        tracker.record(&[narrow.clone(), global.clone()], 2.5);
        assert!((tracker.summary("narrow").unwrap().current_usage - 2.5).abs() < 1e-9);
        assert!((tracker.summary("global_cfg").unwrap().current_usage - 2.5).abs() < 1e-9);
    }

    #[test]
    fn expired_period_resets_usage() {
        let tracker = BudgetTracker::new();
        let config = budget("b1", 1.0);
        tracker.ensure_entry(&config);

        {
            let entry = tracker.usage.get("b1").unwrap();
            let mut usage = entry.lock().unwrap();
            usage.current_usage = 0.95;
            usage.refresh_status();
            // Force the window into the past.
            usage.period_start = Utc::now() - chrono::Duration::days(2);
            usage.period_end = Utc::now() - chrono::Duration::days(1);
        }

        assert_eq!(tracker.reset_expired(), 1);
        let summary = tracker.summary("b1").unwrap();
        assert_eq!(summary.current_usage, 0.0);
        assert_eq!(summary.status, BudgetStatus::Active);
        assert!(summary.period_end > Utc::now());
    }
}
