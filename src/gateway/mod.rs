//! The orchestration gateway.
//!
//! One [`Gateway`] owns the full request pipeline: enrichment, cache,
//! budget admission, rate limiting, routing, circuit-breaker gating, the
//! provider call, response assembly and the usage/analytics side effects.
//! A background task re-probes adapter health and rolls expired budget
//! periods; it holds only a weak handle and exits on shutdown.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::fallback::{default_fallback_config, FALLBACK_MODEL_ID};
use crate::adapters::{self, AdapterRegistry, ChunkStream, ModelAdapter};
use crate::breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitSnapshot};
use crate::budget::{BudgetSummary, BudgetTracker};
use crate::cache::{CacheStats, ResponseCache};
use crate::config::{BudgetConfig, ConfigStore, ModelConfig, ModelUpdate, UserTier};
use crate::cost::CostEstimator;
use crate::ratelimit::RateLimiter;
use crate::router::{RouteContext, Router};
use crate::secrets::SecretStoreService;
use crate::types::{
    enrich, AdapterRequest, AdapterResponse, GatewayRequest, GatewayResponse, HealthCheckResult,
};
use crate::usage::{MemoryAnalytics, UsageLogger, UsageRecord, UsageReport, DEFAULT_FLUSH_BATCH};
use crate::{GatewayError, GatewayResult};

/// Terminal sentinel appended to every completed stream.
pub const STREAM_DONE: &str = "[DONE]";

/// Gateway tuning knobs. All have environment overrides.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub health_check_interval: Duration,
    pub request_timeout: Duration,
    pub provider_timeout: Duration,
    pub usage_flush_batch: usize,
    pub cache_capacity: Option<usize>,
    pub cache_default_ttl_secs: Option<u64>,
    pub global_budget_limit: f64,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(25),
            usage_flush_batch: DEFAULT_FLUSH_BATCH,
            cache_capacity: None,
            cache_default_ttl_secs: None,
            global_budget_limit: crate::budget::DEFAULT_GLOBAL_LIMIT,
        }
    }
}

impl GatewayOptions {
    /// Reads `HEALTH_CHECK_INTERVAL` (seconds), `REQUEST_TIMEOUT_MS`,
    /// `CACHE_CAPACITY`, `CACHE_DEFAULT_TTL` (seconds) and
    /// `USAGE_FLUSH_BATCH` on top of the defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(secs) = env_parse::<u64>("HEALTH_CHECK_INTERVAL") {
            options.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("REQUEST_TIMEOUT_MS") {
            options.request_timeout = Duration::from_millis(ms);
            options.provider_timeout = Duration::from_millis(ms.saturating_sub(5000).max(1000));
        }
        options.cache_capacity = env_parse("CACHE_CAPACITY");
        options.cache_default_ttl_secs = env_parse("CACHE_DEFAULT_TTL");
        if let Some(batch) = env_parse("USAGE_FLUSH_BATCH") {
            options.usage_flush_batch = batch;
        }
        options
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

/// Per-model entry in the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub model_name: String,
    pub healthy: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Full status snapshot returned by [`Gateway::provider_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub active_models: usize,
    pub total_models: usize,
    pub providers: BTreeMap<String, ProviderStatus>,
    pub circuit_breakers: HashMap<String, CircuitSnapshot>,
    pub cache: CacheStats,
    pub global_budget: BudgetSummary,
    pub usage_records_dropped: u64,
}

/// The LLM orchestration gateway.
pub struct Gateway {
    config: Arc<ConfigStore>,
    secrets: Arc<SecretStoreService>,
    registry: AdapterRegistry,
    router: Router,
    adapters: RwLock<HashMap<String, Arc<dyn ModelAdapter>>>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: StdRwLock<ResponseCache>,
    limiter: StdRwLock<RateLimiter>,
    budget: Arc<BudgetTracker>,
    estimator: CostEstimator,
    usage: Arc<UsageLogger>,
    analytics: Arc<MemoryAnalytics>,
    health: RwLock<HashMap<String, HealthCheckResult>>,
    last_health_check: StdMutex<Option<Instant>>,
    initialized: AtomicBool,
    shutdown_token: CancellationToken,
    options: GatewayOptions,
    /// Self-handle for background tasks; they exit once the gateway drops.
    weak_self: Weak<Gateway>,
}

impl Gateway {
    pub fn new(
        config: Arc<ConfigStore>,
        secrets: Arc<SecretStoreService>,
        registry: AdapterRegistry,
        options: GatewayOptions,
    ) -> Arc<Self> {
        let analytics = Arc::new(MemoryAnalytics::new());
        let usage = Arc::new(UsageLogger::new(analytics.clone(), options.usage_flush_batch));
        Arc::new_cyclic(|weak_self| Self {
            router: Router::new(config.clone()),
            config,
            secrets,
            registry,
            adapters: RwLock::new(HashMap::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            cache: StdRwLock::new(ResponseCache::new(&Default::default())),
            limiter: StdRwLock::new(RateLimiter::new(Default::default())),
            budget: Arc::new(BudgetTracker::with_global_limit(options.global_budget_limit)),
            estimator: CostEstimator::new(),
            usage,
            analytics,
            health: RwLock::new(HashMap::new()),
            last_health_check: StdMutex::new(None),
            initialized: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            options,
            weak_self: weak_self.clone(),
        })
    }

    /// Loads configuration, builds one adapter per active model (plus the
    /// always-present fallback), wires circuit breakers, runs one
    /// synchronous health probe and starts the background monitor. Must be
    /// called before any request.
    pub async fn initialize(&self) -> GatewayResult<()> {
        info!("initializing gateway");
        self.config.load_configurations().await?;

        let active_models = self.config.active_models().await;
        if active_models.is_empty() {
            warn!("no active models configured; only the fallback adapter will serve");
        }

        let mut adapters: HashMap<String, Arc<dyn ModelAdapter>> = HashMap::new();
        for model in &active_models {
            let adapter = self.registry.create(model.clone(), self.secrets.clone())?;
            self.breakers
                .add_model(&model.model_id, Some(breaker_config(model)));
            adapters.insert(model.model_id.clone(), adapter);
        }

        if !adapters.contains_key(FALLBACK_MODEL_ID) {
            let fallback = default_fallback_config();
            let adapter = self.registry.create(fallback.clone(), self.secrets.clone())?;
            self.breakers
                .add_model(FALLBACK_MODEL_ID, Some(breaker_config(&fallback)));
            adapters.insert(FALLBACK_MODEL_ID.to_string(), adapter);
        }

        let adapter_count = adapters.len();
        *self.adapters.write().await = adapters;

        let mut caching = self.config.caching_config().await;
        if let Some(capacity) = self.options.cache_capacity {
            caching.max_entries = capacity;
        }
        if let Some(ttl) = self.options.cache_default_ttl_secs {
            caching.default_ttl_secs = ttl;
        }
        *self.cache.write().expect("cache lock poisoned") = ResponseCache::new(&caching);
        *self.limiter.write().expect("limiter lock poisoned") =
            RateLimiter::new(self.config.rate_limit_config().await);

        self.perform_health_check().await;
        self.initialized.store(true, Ordering::SeqCst);
        self.spawn_monitor();

        info!(adapters = adapter_count, "gateway initialized");
        Ok(())
    }

    /// Full pipeline for a non-streaming request.
    pub async fn process_request(&self, request: GatewayRequest) -> GatewayResult<GatewayResponse> {
        self.ensure_initialized()?;
        match tokio::time::timeout(self.options.request_timeout, self.process_inner(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout("request deadline elapsed".into())),
        }
    }

    async fn process_inner(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        let started = Instant::now();
        let enriched = enrich(request)?;
        debug!(request_id = %enriched.request_id, user_id = %enriched.user_id, "processing request");

        if let Some(hit) = self.cache_lookup(&enriched) {
            debug!(request_id = %enriched.request_id, "cache hit");
            self.log_success(&enriched, &hit, &[]).await;
            return Ok(hit);
        }

        let tier = self.resolve_tier(&enriched).await;
        let groups: Vec<String> = enriched.user_tier.clone().into_iter().collect();

        let estimated_cost = self
            .estimator
            .estimate_request(&enriched.prompt, enriched.max_tokens.unwrap_or(1000));
        let budgets = self.applicable_budgets(&groups).await;
        self.budget.admit(&budgets, estimated_cost)?;

        let multiplier = tier.as_ref().map(|t| t.rate_limit_multiplier).unwrap_or(1.0);
        self.limiter
            .read()
            .expect("limiter lock poisoned")
            .check_request(&enriched.user_id, multiplier)?;

        let (selected, adapter) = self.select_adapter(&enriched, tier.as_ref()).await?;

        let rpm = self.config.model_rpm(adapter.model_config()).await;
        self.limiter
            .read()
            .expect("limiter lock poisoned")
            .check_model(&selected, rpm)?;

        match self.execute(&adapter, &enriched).await {
            Ok(adapter_response) => {
                self.breakers.record_success(&selected);
                let response = build_response(&enriched, adapter_response, started, false);
                self.cache
                    .read()
                    .expect("cache lock poisoned")
                    .put(&enriched, &response);
                self.log_success(&enriched, &response, &budgets).await;
                Ok(response)
            }
            Err(e) => {
                if e.counts_as_provider_failure() {
                    self.breakers.record_failure(&selected);
                    if let Some(response) = self.error_fallback(&enriched, &e, started).await {
                        self.log_success(&enriched, &response, &budgets).await;
                        return Ok(response);
                    }
                }
                self.log_failure(&enriched, &adapter, &e, started).await;
                Err(e)
            }
        }
    }

    /// Pipeline for a streaming request. Yields UTF-8 content chunks and a
    /// terminal `[DONE]` sentinel; cancelling the token stops the provider
    /// stream. Usage is logged once the stream completes, errors or is
    /// cancelled, counting the tokens emitted so far. Streams are never
    /// written to the cache.
    pub async fn process_stream(
        &self,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<ChunkStream> {
        self.ensure_initialized()?;

        let mut request = request;
        request.stream = true;
        let enriched = enrich(&request)?;
        debug!(request_id = %enriched.request_id, "processing streaming request");

        let tier = self.resolve_tier(&enriched).await;
        let groups: Vec<String> = enriched.user_tier.clone().into_iter().collect();

        let estimated_cost = self
            .estimator
            .estimate_request(&enriched.prompt, enriched.max_tokens.unwrap_or(1000));
        let budgets = self.applicable_budgets(&groups).await;
        self.budget.admit(&budgets, estimated_cost)?;

        let multiplier = tier.as_ref().map(|t| t.rate_limit_multiplier).unwrap_or(1.0);
        self.limiter
            .read()
            .expect("limiter lock poisoned")
            .check_request(&enriched.user_id, multiplier)?;

        let (selected, adapter) = self.select_adapter(&enriched, tier.as_ref()).await?;
        if !adapter.model_config().supports_streaming {
            return Err(GatewayError::InvalidRequest(format!(
                "model {selected} does not support streaming"
            )));
        }

        let rpm = self.config.model_rpm(adapter.model_config()).await;
        self.limiter
            .read()
            .expect("limiter lock poisoned")
            .check_model(&selected, rpm)?;

        let upstream = match tokio::time::timeout(
            self.options.provider_timeout,
            adapter.stream(enriched.clone()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if e.counts_as_provider_failure() {
                    self.breakers.record_failure(&selected);
                }
                self.log_failure(&enriched, &adapter, &e, Instant::now()).await;
                return Err(e);
            }
            Err(_) => {
                let e = GatewayError::Timeout(format!("provider stream to {selected} timed out"));
                self.breakers.record_failure(&selected);
                self.log_failure(&enriched, &adapter, &e, Instant::now()).await;
                return Err(e);
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<GatewayResult<String>>(32);
        let usage = self.usage.clone();
        let budget = self.budget.clone();
        let breakers = self.breakers.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut emitted = String::new();
            let mut stream_error: Option<GatewayError> = None;
            let mut cancelled = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("stream cancelled by caller");
                        cancelled = true;
                        break;
                    }
                    next = upstream.next() => match next {
                        Some(Ok(chunk)) => {
                            emitted.push_str(&chunk);
                            if tx.send(Ok(chunk)).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.clone())).await;
                            stream_error = Some(e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            // Dropping the upstream here propagates cancellation to the
            // provider connection.
            drop(upstream);

            if stream_error.is_none() && !cancelled {
                let _ = tx.send(Ok(STREAM_DONE.to_string())).await;
                breakers.record_success(adapter.model_id());
            } else if let Some(e) = &stream_error {
                if e.counts_as_provider_failure() {
                    breakers.record_failure(adapter.model_id());
                }
            }

            let tokens_emitted = emitted.split_whitespace().count() as u32;
            let cost = adapter.estimate_cost(&enriched.prompt, tokens_emitted);
            let record = UsageRecord {
                request_id: enriched.request_id.clone(),
                user_id: enriched.user_id.clone(),
                model_used: adapter.model_config().model_name.clone(),
                provider: adapter.provider().to_string(),
                tokens_used: tokens_emitted,
                cost,
                latency_ms: started.elapsed().as_millis() as u64,
                cached: false,
                success: stream_error.is_none(),
                task_type: enriched.task_type.clone(),
                session_id: enriched.session_id.clone(),
                error: stream_error.as_ref().map(|e| e.to_string()),
                timestamp: Utc::now(),
            };
            usage.log(record).await;
            for alert in budget.record(&budgets, cost) {
                usage.emit_alert(&alert).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Status snapshot over every adapter, circuit, the cache and the
    /// global budget. Re-probes health when the last probe is older than
    /// the configured interval.
    pub async fn provider_status(&self) -> GatewayResult<SystemStatus> {
        self.ensure_initialized()?;

        let stale = self
            .last_health_check
            .lock()
            .expect("health clock poisoned")
            .map(|at| at.elapsed() > self.options.health_check_interval)
            .unwrap_or(true);
        if stale {
            self.perform_health_check().await;
        }

        let adapters = self.adapters.read().await;
        let health = self.health.read().await;

        let mut providers = BTreeMap::new();
        for (model_id, adapter) in adapters.iter() {
            let result = health.get(model_id);
            providers.insert(
                model_id.clone(),
                ProviderStatus {
                    provider: adapter.provider().to_string(),
                    model_name: adapter.model_config().model_name.clone(),
                    healthy: result.map(|r| r.healthy).unwrap_or(false),
                    latency_ms: result.and_then(|r| r.latency_ms),
                    last_check: result.map(|r| r.checked_at).unwrap_or_else(Utc::now),
                    error: result.and_then(|r| r.error.clone()),
                },
            );
        }

        Ok(SystemStatus {
            active_models: providers.values().filter(|p| p.healthy).count(),
            total_models: providers.len(),
            providers,
            circuit_breakers: self.breakers.snapshot_all(),
            cache: self.cache.read().expect("cache lock poisoned").stats(),
            global_budget: self.budget.global_summary(),
            usage_records_dropped: self.usage.dropped_count(),
        })
    }

    // Admin surface

    pub async fn admin_add_model(&self, config: ModelConfig) -> GatewayResult<()> {
        self.config.add_model(config.clone()).await?;
        if config.is_active {
            let adapter = self.registry.create(config.clone(), self.secrets.clone())?;
            self.breakers
                .add_model(&config.model_id, Some(breaker_config(&config)));
            self.adapters
                .write()
                .await
                .insert(config.model_id.clone(), adapter);
        }
        Ok(())
    }

    pub async fn admin_update_model(
        &self,
        model_id: &str,
        update: ModelUpdate,
    ) -> GatewayResult<ModelConfig> {
        let updated = self.config.update_model(model_id, update).await?;
        let mut adapters = self.adapters.write().await;
        if adapters.contains_key(model_id) {
            let adapter = self.registry.create(updated.clone(), self.secrets.clone())?;
            adapters.insert(model_id.to_string(), adapter);
            self.breakers.remove_model(model_id);
            self.breakers
                .add_model(model_id, Some(breaker_config(&updated)));
        }
        Ok(updated)
    }

    /// In-flight requests keep the adapter they already resolved; the next
    /// request observes the new set.
    pub async fn admin_toggle_model(&self, model_id: &str, is_active: bool) -> GatewayResult<()> {
        self.config.toggle_model(model_id, is_active).await?;
        if !is_active {
            self.adapters.write().await.remove(model_id);
            self.breakers.remove_model(model_id);
        } else if let Some(config) = self.config.model(model_id).await {
            let mut adapters = self.adapters.write().await;
            if !adapters.contains_key(model_id) {
                let adapter = self.registry.create(config.clone(), self.secrets.clone())?;
                self.breakers
                    .add_model(model_id, Some(breaker_config(&config)));
                adapters.insert(model_id.to_string(), adapter);
            }
        }
        Ok(())
    }

    pub async fn usage_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<&str>,
    ) -> UsageReport {
        self.usage.flush().await;
        self.analytics.usage_report(start, end, user_id).await
    }

    /// Forces buffered usage records through to the sink.
    pub async fn flush_usage(&self) {
        self.usage.flush().await;
    }

    /// Flushes side effects, stops the monitor and clears the adapter set.
    pub async fn shutdown(&self) {
        info!("shutting down gateway");
        self.shutdown_token.cancel();
        self.usage.flush().await;
        self.adapters.write().await.clear();
        self.initialized.store(false, Ordering::SeqCst);
    }

    // Pipeline helpers

    fn ensure_initialized(&self) -> GatewayResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::NotInitialized)
        }
    }

    fn cache_lookup(&self, enriched: &AdapterRequest) -> Option<GatewayResponse> {
        let mut hit = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .get(enriched)?;
        // A hit belongs to the current request: fresh identity, no charge.
        hit.request_id = enriched.request_id.clone();
        hit.user_id = enriched.user_id.clone();
        hit.session_id = enriched.session_id.clone();
        hit.cost_estimate = 0.0;
        Some(hit)
    }

    async fn resolve_tier(&self, enriched: &AdapterRequest) -> Option<UserTier> {
        match &enriched.user_tier {
            Some(tier_id) => self.config.user_tier(tier_id).await,
            None => None,
        }
    }

    async fn applicable_budgets(&self, groups: &[String]) -> Vec<BudgetConfig> {
        let mut budgets = Vec::new();
        if let Some(budget) = self.config.budget_for_groups(groups).await {
            budgets.push(budget);
        }
        if let Some(global) = self.config.global_budget().await {
            if !budgets.iter().any(|b| b.budget_id == global.budget_id) {
                budgets.push(global);
            }
        }
        budgets
    }

    /// Models the router may choose from: active (present in the adapter
    /// set), circuit-admissible and tier-allowed, in stable sorted order.
    /// The fallback adapter is excluded here; it is the last resort only.
    async fn available_model_ids(&self, tier: Option<&UserTier>) -> Vec<String> {
        let adapters = self.adapters.read().await;
        let mut ids: Vec<String> = adapters
            .keys()
            .filter(|id| id.as_str() != FALLBACK_MODEL_ID)
            .filter(|id| self.breakers.can_proceed(id))
            .filter(|id| match tier {
                Some(tier) if !tier.model_access.is_empty() => tier.model_access.contains(id),
                _ => true,
            })
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    async fn select_adapter(
        &self,
        enriched: &AdapterRequest,
        tier: Option<&UserTier>,
    ) -> GatewayResult<(String, Arc<dyn ModelAdapter>)> {
        let available = self.available_model_ids(tier).await;
        let context = RouteContext::from_request(enriched);

        let selected = match self.router.select_model(&context, &available).await {
            Ok(model_id) => model_id,
            Err(GatewayError::NoHealthyModel) => {
                let has_fallback = self.adapters.read().await.contains_key(FALLBACK_MODEL_ID);
                if has_fallback && self.breakers.can_proceed(FALLBACK_MODEL_ID) {
                    warn!("no routable model available, using fallback adapter");
                    FALLBACK_MODEL_ID.to_string()
                } else {
                    return Err(GatewayError::NoHealthyModel);
                }
            }
            Err(e) => return Err(e),
        };

        let adapter = self
            .adapters
            .read()
            .await
            .get(&selected)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Internal(format!("selected model {selected} has no adapter"))
            })?;
        Ok((selected, adapter))
    }

    async fn execute(
        &self,
        adapter: &Arc<dyn ModelAdapter>,
        enriched: &AdapterRequest,
    ) -> GatewayResult<AdapterResponse> {
        match tokio::time::timeout(self.options.provider_timeout, adapter.generate(enriched)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "provider call to {} timed out",
                adapter.model_id()
            ))),
        }
    }

    /// One more attempt against the fallback adapter after a provider
    /// failure. The caller sees a degraded 200-equivalent response with the
    /// original error carried in metadata.
    async fn error_fallback(
        &self,
        enriched: &AdapterRequest,
        original: &GatewayError,
        started: Instant,
    ) -> Option<GatewayResponse> {
        let adapter = self.adapters.read().await.get(FALLBACK_MODEL_ID).cloned()?;
        match adapter.generate(enriched).await {
            Ok(adapter_response) => {
                let mut response = build_response(enriched, adapter_response, started, false);
                response.content = format!("Service temporarily unavailable. {}", response.content);
                response.cost_estimate = 0.0;
                response
                    .metadata
                    .insert("error".into(), serde_json::json!(original.to_string()));
                response.metadata.insert("fallback".into(), serde_json::json!(true));
                Some(response)
            }
            Err(e) => {
                error!(error = %e, "fallback adapter also failed");
                None
            }
        }
    }

    async fn log_success(
        &self,
        enriched: &AdapterRequest,
        response: &GatewayResponse,
        budgets: &[BudgetConfig],
    ) {
        let record = UsageRecord {
            request_id: response.request_id.clone(),
            user_id: response.user_id.clone(),
            model_used: response.model_used.clone(),
            provider: response.provider.clone(),
            tokens_used: response.tokens_used,
            cost: response.cost_estimate,
            latency_ms: response.latency_ms,
            cached: response.cached,
            success: true,
            task_type: enriched.task_type.clone(),
            session_id: enriched.session_id.clone(),
            error: response
                .metadata
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            timestamp: Utc::now(),
        };
        self.usage.log(record).await;

        if !response.cached {
            for alert in self.budget.record(budgets, response.cost_estimate) {
                self.usage.emit_alert(&alert).await;
            }
        }
    }

    async fn log_failure(
        &self,
        enriched: &AdapterRequest,
        adapter: &Arc<dyn ModelAdapter>,
        error: &GatewayError,
        started: Instant,
    ) {
        let record = UsageRecord {
            request_id: enriched.request_id.clone(),
            user_id: enriched.user_id.clone(),
            model_used: adapter.model_config().model_name.clone(),
            provider: adapter.provider().to_string(),
            tokens_used: 0,
            cost: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            success: false,
            task_type: enriched.task_type.clone(),
            session_id: enriched.session_id.clone(),
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        };
        self.usage.log(record).await;
    }

    async fn perform_health_check(&self) {
        let adapters = self.adapters.read().await.clone();
        let results = adapters::health_check_all(&adapters).await;

        for (model_id, result) in &results {
            if result.healthy {
                self.breakers.record_success(model_id);
            } else {
                warn!(model_id = %model_id, error = ?result.error, "health check failed");
                self.breakers.record_failure(model_id);
            }
        }

        *self.health.write().await = results;
        *self.last_health_check.lock().expect("health clock poisoned") = Some(Instant::now());
    }

    /// Background loop: periodic health probes and budget period resets.
    /// Holds a weak handle so shutdown (or drop) ends the task.
    fn spawn_monitor(&self) {
        let weak = self.weak_self.clone();
        let token = self.shutdown_token.clone();
        let interval = self.options.health_check_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(gateway) = weak.upgrade() else {
                    break;
                };
                gateway.perform_health_check().await;
                gateway.budget.reset_expired();
            }
            debug!("gateway monitor exited");
        });
    }
}

fn breaker_config(config: &ModelConfig) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: config.circuit_breaker_threshold,
        recovery_timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
        half_open_max_calls: 3,
    }
}

fn build_response(
    enriched: &AdapterRequest,
    adapter_response: AdapterResponse,
    started: Instant,
    cached: bool,
) -> GatewayResponse {
    GatewayResponse {
        content: adapter_response.content,
        model_used: adapter_response.model_used,
        provider: adapter_response.provider.to_string(),
        request_id: enriched.request_id.clone(),
        tokens_used: adapter_response.tokens_used,
        cost_estimate: adapter_response.cost_estimate,
        latency_ms: started.elapsed().as_millis() as u64,
        cached,
        user_id: enriched.user_id.clone(),
        session_id: enriched.session_id.clone(),
        metadata: enriched.metadata.clone(),
    }
}
