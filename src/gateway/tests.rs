//! End-to-end pipeline tests with scripted adapters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::adapters::{AdapterFactory, ChunkStream, ModelAdapter};
use crate::config::{
    AbTest, ConfigStore, ModelConfig, ModelPriority, RateLimitConfig, ResetPeriod,
};
use crate::secrets::{SecretReference, SecretStoreService};
use crate::types::{AdapterRequest, AdapterResponse, ProviderKind};

struct ScriptedAdapter {
    config: ModelConfig,
    content: String,
    cost: f64,
    fail: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedAdapter {
    fn new(config: ModelConfig, content: &str, cost: f64) -> Arc<Self> {
        Arc::new(Self {
            config,
            content: content.to_string(),
            cost,
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        })
    }

    fn failing(config: ModelConfig) -> Arc<Self> {
        let adapter = Self::new(config, "never", 0.0);
        adapter.fail.store(true, Ordering::SeqCst);
        adapter
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(&self, _request: &AdapterRequest) -> crate::GatewayResult<AdapterResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(crate::GatewayError::provider(
                crate::ProviderFailure::Api,
                "scripted failure",
            ));
        }
        Ok(AdapterResponse {
            content: self.content.clone(),
            model_used: self.config.model_name.clone(),
            provider: self.config.provider,
            tokens_used: 10,
            cost_estimate: self.cost,
            latency_ms: 5,
        })
    }

    async fn stream(&self, _request: AdapterRequest) -> crate::GatewayResult<ChunkStream> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(crate::GatewayError::provider(
                crate::ProviderFailure::Api,
                "scripted failure",
            ));
        }
        let words: Vec<String> = self
            .content
            .split_whitespace()
            .map(|word| format!("{word} "))
            .collect();
        let chunks = futures::stream::iter(words).then(|word| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<String, crate::GatewayError>(word)
        });
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> crate::types::HealthCheckResult {
        crate::types::HealthCheckResult::healthy(1)
    }

    fn estimate_cost(&self, _prompt: &str, _max_tokens: u32) -> f64 {
        self.cost
    }
}

struct ScriptedFactory {
    adapters: Mutex<HashMap<String, Arc<ScriptedAdapter>>>,
}

impl ScriptedFactory {
    fn new(adapters: Vec<Arc<ScriptedAdapter>>) -> Arc<Self> {
        Arc::new(Self {
            adapters: Mutex::new(
                adapters
                    .into_iter()
                    .map(|a| (a.config.model_id.clone(), a))
                    .collect(),
            ),
        })
    }
}

impl AdapterFactory for ScriptedFactory {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn create(
        &self,
        config: ModelConfig,
        _secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter> {
        self.adapters
            .lock()
            .unwrap()
            .get(&config.model_id)
            .cloned()
            .unwrap_or_else(|| panic!("no scripted adapter for {}", config.model_id))
    }
}

fn model(id: &str, priority: ModelPriority) -> ModelConfig {
    let mut config = ModelConfig::new(
        id,
        ProviderKind::OpenAi,
        format!("{id}-wire"),
        SecretReference::env("UNUSED"),
    );
    config.priority = priority;
    config
}

fn request(prompt: &str, user: &str) -> GatewayRequest {
    let mut request = GatewayRequest::new(prompt, user);
    request.max_tokens = Some(50);
    request.temperature = Some(0.7);
    request
}

async fn build_gateway(
    store: Arc<ConfigStore>,
    scripted: Vec<Arc<ScriptedAdapter>>,
) -> Arc<Gateway> {
    let mut registry = AdapterRegistry::empty();
    registry.register(ScriptedFactory::new(scripted));
    registry.register(Arc::new(crate::adapters::fallback::FallbackFactory));

    let gateway = Gateway::new(
        store,
        Arc::new(SecretStoreService::new()),
        registry,
        GatewayOptions::default(),
    );
    gateway.initialize().await.unwrap();
    gateway
}

async fn single_model_gateway() -> (Arc<Gateway>, Arc<ScriptedAdapter>) {
    let store = Arc::new(ConfigStore::new());
    let config = model("m1", ModelPriority::Medium);
    store.add_model(config.clone()).await.unwrap();
    let adapter = ScriptedAdapter::new(config, "the scripted answer", 0.01);
    let gateway = build_gateway(store, vec![adapter.clone()]).await;
    (gateway, adapter)
}

#[tokio::test]
async fn rejects_requests_before_initialize() {
    let gateway = Gateway::new(
        Arc::new(ConfigStore::new()),
        Arc::new(SecretStoreService::new()),
        AdapterRegistry::empty(),
        GatewayOptions::default(),
    );
    let err = gateway
        .process_request(request("hello", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotInitialized));
}

#[tokio::test]
async fn cache_hit_returns_same_content_and_latency() {
    let (gateway, adapter) = single_model_gateway().await;

    let first = gateway
        .process_request(request("Hello", "u1"))
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.content, "the scripted answer");

    let second = gateway
        .process_request(request("Hello", "u1"))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    assert_eq!(second.latency_ms, first.latency_ms);
    assert_ne!(second.request_id, first.request_id);
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1, "one provider call");
}

#[tokio::test]
async fn budget_denial_reports_usage_and_limit() {
    let store = Arc::new(ConfigStore::new());
    let config = model("m1", ModelPriority::Medium);
    store.add_model(config.clone()).await.unwrap();
    let budget = crate::config::BudgetConfig {
        budget_id: "daily".into(),
        name: "daily".into(),
        total_budget: 1.0,
        reset_period: ResetPeriod::Daily,
        alert_thresholds: vec![],
        auto_disable_at_limit: true,
        user_groups: vec![],
        created_at: Utc::now(),
    };
    store.create_budget(budget.clone()).await.unwrap();

    let adapter = ScriptedAdapter::new(config, "answer", 0.01);
    let gateway = build_gateway(store, vec![adapter]).await;
    gateway.budget.seed_usage(&budget, 0.99);

    // 10_000 requested output tokens put the estimate at ~0.02 USD.
    let mut denied = request("Hello", "u1");
    denied.max_tokens = Some(10_000);
    let err = gateway.process_request(denied).await.unwrap_err();
    match err {
        GatewayError::BudgetExceeded {
            budget_id,
            current_usage,
            limit,
            ..
        } => {
            assert_eq!(budget_id, "daily");
            assert!((current_usage - 0.99).abs() < 1e-9);
            assert!((limit - 1.0).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn circuit_opens_and_router_avoids_broken_model() {
    let store = Arc::new(ConfigStore::new());
    let mut m1 = model("m1", ModelPriority::Highest);
    m1.circuit_breaker_threshold = 3;
    let m2 = model("m2", ModelPriority::Low);
    store.add_model(m1.clone()).await.unwrap();
    store.add_model(m2.clone()).await.unwrap();

    let broken = ScriptedAdapter::failing(m1);
    let healthy = ScriptedAdapter::new(m2, "from-m2", 0.01);
    let gateway = build_gateway(store, vec![broken.clone(), healthy]).await;

    // Three failures trip the breaker; each is answered by error-fallback.
    for _ in 0..3 {
        let response = gateway
            .process_request(request("Hello", "u1"))
            .await
            .unwrap();
        assert_eq!(response.provider, "fallback");
    }
    assert_eq!(broken.calls.load(Ordering::SeqCst), 3);

    // With m1 open the router must land on m2.
    let response = gateway
        .process_request(request("Hello again", "u1"))
        .await
        .unwrap();
    assert_eq!(response.content, "from-m2");
    assert_eq!(broken.calls.load(Ordering::SeqCst), 3, "m1 not called again");
}

#[tokio::test]
async fn ab_assignment_is_stable_across_requests() {
    let store = Arc::new(ConfigStore::new());
    let m1 = model("m1", ModelPriority::Medium);
    let m2 = model("m2", ModelPriority::Medium);
    store.add_model(m1.clone()).await.unwrap();
    store.add_model(m2.clone()).await.unwrap();
    store
        .create_ab_test(AbTest {
            test_id: "t1".into(),
            name: "t1".into(),
            description: String::new(),
            is_active: true,
            start_date: Utc::now() - chrono::Duration::hours(1),
            end_date: Utc::now() + chrono::Duration::hours(1),
            traffic_split: BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]),
            model_variants: BTreeMap::from([
                ("a".to_string(), vec!["m1".to_string()]),
                ("b".to_string(), vec!["m2".to_string()]),
            ]),
            success_metrics: vec![],
            metadata: HashMap::new(),
        })
        .await
        .unwrap();

    let a = ScriptedAdapter::new(m1, "variant-a", 0.01);
    let b = ScriptedAdapter::new(m2, "variant-b", 0.01);
    let gateway = build_gateway(store, vec![a, b]).await;

    let mut contents = std::collections::HashSet::new();
    for i in 0..10 {
        let response = gateway
            .process_request(request(&format!("prompt {i}"), "u1"))
            .await
            .unwrap();
        contents.insert(response.content);
    }
    assert_eq!(contents.len(), 1, "one variant for one user");
}

#[tokio::test]
async fn error_fallback_returns_degraded_response() {
    let store = Arc::new(ConfigStore::new());
    let config = model("m1", ModelPriority::Medium);
    store.add_model(config.clone()).await.unwrap();

    let broken = ScriptedAdapter::failing(config);
    let gateway = build_gateway(store, vec![broken]).await;

    let response = gateway
        .process_request(request("Hello", "u1"))
        .await
        .unwrap();
    assert!(response.content.starts_with("Service temporarily unavailable"));
    assert_eq!(response.provider, "fallback");
    assert_eq!(response.cost_estimate, 0.0);
    let error = response.metadata.get("error").unwrap().as_str().unwrap();
    assert!(error.contains("scripted failure"));
}

#[tokio::test]
async fn streaming_cancellation_logs_partial_tokens_and_skips_cache() {
    let store = Arc::new(ConfigStore::new());
    let config = model("m1", ModelPriority::Medium);
    store.add_model(config.clone()).await.unwrap();
    let adapter = ScriptedAdapter::new(config, "one two three four five six", 0.01);
    let gateway = build_gateway(store, vec![adapter]).await;

    let cancel = CancellationToken::new();
    let mut stream = gateway
        .process_stream(request("Streamed prompt", "u1"), cancel.clone())
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        received.push(stream.next().await.unwrap().unwrap());
    }
    cancel.cancel();
    drop(stream);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(received, vec!["one ".to_string(), "two ".to_string()]);

    gateway.flush_usage().await;
    let records = gateway.analytics.records().await;
    let record = records
        .iter()
        .find(|r| r.user_id == "u1" && !r.cached)
        .expect("stream usage record written");
    assert_eq!(record.tokens_used, 2, "only emitted tokens counted");
    assert!(record.success);

    // No cache write happened: the same prompt misses.
    let follow_up = gateway
        .process_request(request("Streamed prompt", "u1"))
        .await
        .unwrap();
    assert!(!follow_up.cached);
}

#[tokio::test]
async fn completed_stream_ends_with_done_sentinel() {
    let (gateway, _adapter) = single_model_gateway().await;

    let mut stream = gateway
        .process_stream(request("Hello", "u1"), CancellationToken::new())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(chunks.last().map(|s| s.as_str()), Some(STREAM_DONE));
    let text: String = chunks[..chunks.len() - 1].concat();
    assert_eq!(text.trim(), "the scripted answer");
}

#[tokio::test]
async fn every_successful_request_writes_one_usage_record() {
    let (gateway, _adapter) = single_model_gateway().await;

    let response = gateway
        .process_request(request("Hello", "u1"))
        .await
        .unwrap();

    gateway.flush_usage().await;
    let records = gateway.analytics.records().await;
    let matching: Vec<_> = records
        .iter()
        .filter(|r| r.request_id == response.request_id)
        .collect();
    assert_eq!(matching.len(), 1);
    assert!((matching[0].cost - response.cost_estimate).abs() < 1e-12);
    assert!(matching[0].success);
}

#[tokio::test]
async fn rate_limit_denies_when_user_bucket_empties() {
    let store = Arc::new(ConfigStore::new());
    let config = model("m1", ModelPriority::Medium);
    store.add_model(config.clone()).await.unwrap();
    store
        .set_rate_limit_config(RateLimitConfig {
            global_rpm: 1000,
            per_user_rpm: 2,
            per_model_rpm: BTreeMap::new(),
            burst_allowance: 0,
        })
        .await
        .unwrap();

    let adapter = ScriptedAdapter::new(config, "answer", 0.0);
    let gateway = build_gateway(store, vec![adapter]).await;

    // Distinct prompts so the cache stays out of the way.
    assert!(gateway.process_request(request("p1", "u1")).await.is_ok());
    assert!(gateway.process_request(request("p2", "u1")).await.is_ok());
    let err = gateway.process_request(request("p3", "u1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { .. }));
}

#[tokio::test]
async fn invalid_requests_are_rejected_up_front() {
    let (gateway, adapter) = single_model_gateway().await;

    let mut oversized = request("x", "u1");
    oversized.prompt = "a".repeat(crate::types::MAX_PROMPT_CHARS + 1);
    assert!(matches!(
        gateway.process_request(oversized).await,
        Err(GatewayError::InvalidRequest(_))
    ));

    let mut bad_temperature = request("hello", "u1");
    bad_temperature.temperature = Some(2.01);
    assert!(matches!(
        gateway.process_request(bad_temperature).await,
        Err(GatewayError::InvalidRequest(_))
    ));

    assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn toggling_a_model_off_reroutes_the_next_request() {
    let store = Arc::new(ConfigStore::new());
    let m1 = model("m1", ModelPriority::Highest);
    let m2 = model("m2", ModelPriority::Low);
    store.add_model(m1.clone()).await.unwrap();
    store.add_model(m2.clone()).await.unwrap();

    let first = ScriptedAdapter::new(m1, "from-m1", 0.01);
    let second = ScriptedAdapter::new(m2, "from-m2", 0.01);
    let gateway = build_gateway(store, vec![first, second]).await;

    let response = gateway.process_request(request("p1", "u1")).await.unwrap();
    assert_eq!(response.content, "from-m1");

    gateway.admin_toggle_model("m1", false).await.unwrap();
    let response = gateway.process_request(request("p2", "u1")).await.unwrap();
    assert_eq!(response.content, "from-m2");
}

#[tokio::test]
async fn tier_restrictions_limit_model_access() {
    let store = Arc::new(ConfigStore::new());
    let m1 = model("m1", ModelPriority::Highest);
    let m2 = model("m2", ModelPriority::Low);
    store.add_model(m1.clone()).await.unwrap();
    store.add_model(m2.clone()).await.unwrap();
    store
        .create_user_tier(crate::config::UserTier {
            tier_id: "basic".into(),
            name: "Basic".into(),
            model_access: vec!["m2".into()],
            priority_boost: 0,
            rate_limit_multiplier: 1.0,
            api_key_overrides: BTreeMap::new(),
            features: vec![],
        })
        .await
        .unwrap();

    let premium = ScriptedAdapter::new(m1, "premium-model", 0.01);
    let basic = ScriptedAdapter::new(m2, "basic-model", 0.01);
    let gateway = build_gateway(store, vec![premium, basic]).await;

    let mut tiered = request("hello", "u1");
    tiered.user_tier = Some("basic".into());
    let response = gateway.process_request(tiered).await.unwrap();
    assert_eq!(response.content, "basic-model");
}

#[tokio::test]
async fn status_snapshot_reports_models_and_circuits() {
    let (gateway, _adapter) = single_model_gateway().await;
    gateway.process_request(request("warm", "u1")).await.unwrap();

    let status = gateway.provider_status().await.unwrap();
    assert_eq!(status.total_models, 2, "m1 plus the fallback adapter");
    assert!(status.active_models >= 1);
    assert!(status.providers.contains_key("m1"));
    assert!(status.providers.contains_key("fallback"));
    assert!(status.circuit_breakers.contains_key("m1"));
    assert!(status.cache.size >= 1);
    assert!(status.global_budget.current_usage > 0.0);
}

#[tokio::test]
async fn shutdown_flushes_usage_and_blocks_requests() {
    let (gateway, _adapter) = single_model_gateway().await;
    gateway.process_request(request("Hello", "u1")).await.unwrap();

    gateway.shutdown().await;
    assert!(!gateway.analytics.records().await.is_empty());
    assert!(matches!(
        gateway.process_request(request("again", "u1")).await,
        Err(GatewayError::NotInitialized)
    ));
}

#[tokio::test]
async fn usage_report_covers_processed_requests() {
    let (gateway, _adapter) = single_model_gateway().await;
    gateway.process_request(request("p1", "u1")).await.unwrap();
    gateway.process_request(request("p2", "u2")).await.unwrap();

    let report = gateway
        .usage_report(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
            None,
        )
        .await;
    assert_eq!(report.total_requests, 2);
    assert!(report.total_cost > 0.0);

    let filtered = gateway
        .usage_report(
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
            Some("u2"),
        )
        .await;
    assert_eq!(filtered.total_requests, 1);
}
