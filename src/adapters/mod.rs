//! Provider adapters.
//!
//! Every model resolves to exactly one adapter implementing the uniform
//! [`ModelAdapter`] contract: generate, stream, health-check and cost
//! estimation. Concrete adapters translate the uniform request into the
//! provider's wire format and fetch their API key lazily from the secret
//! store, caching it per adapter. Adding a provider is a registry insert,
//! not a conditional chain.

pub mod anthropic;
pub mod fallback;
pub mod gemini;
pub mod openai;
pub mod perplexity;
pub mod sse;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ModelConfig;
use crate::secrets::{SecretReference, SecretStoreService};
use crate::types::{AdapterRequest, AdapterResponse, HealthCheckResult, ProviderKind};
use crate::{GatewayError, GatewayResult};

/// Default per-call deadline for provider requests.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(25);
/// Deadline for health probes.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a fetched API key stays cached inside an adapter.
pub const KEY_TTL: Duration = Duration::from_secs(3600);

/// Stream of UTF-8 content chunks from a provider.
pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<String>> + Send>>;

/// Uniform contract over provider wire protocols.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn model_id(&self) -> &str;

    fn provider(&self) -> ProviderKind;

    fn model_config(&self) -> &ModelConfig;

    /// Single-shot completion.
    async fn generate(&self, request: &AdapterRequest) -> GatewayResult<AdapterResponse>;

    /// Streaming completion; yields content text only.
    async fn stream(&self, request: AdapterRequest) -> GatewayResult<ChunkStream>;

    async fn health_check(&self) -> HealthCheckResult;

    /// Pre-call cost estimate in USD.
    fn estimate_cost(&self, prompt: &str, max_tokens: u32) -> f64;
}

/// Lazily resolved API key with a per-adapter TTL cache.
pub struct ApiKeyCache {
    secrets: Arc<SecretStoreService>,
    reference: SecretReference,
    cached: Mutex<Option<(String, Instant)>>,
    ttl: Duration,
}

impl ApiKeyCache {
    pub fn new(secrets: Arc<SecretStoreService>, reference: SecretReference) -> Self {
        Self {
            secrets,
            reference,
            cached: Mutex::new(None),
            ttl: KEY_TTL,
        }
    }

    pub async fn get(&self) -> GatewayResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some((key, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(key.clone());
            }
        }

        let key = self.secrets.get_secret(&self.reference).await?;
        debug!(secret = %self.reference.secret_identifier, "refreshed adapter API key");
        *cached = Some((key.clone(), Instant::now()));
        Ok(key)
    }
}

/// Constructs adapters for one provider kind.
pub trait AdapterFactory: Send + Sync {
    fn provider(&self) -> ProviderKind;

    fn create(
        &self,
        config: ModelConfig,
        secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter>;
}

/// Registry keyed by provider kind. Adding a provider is one insert.
pub struct AdapterRegistry {
    factories: HashMap<ProviderKind, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in provider registered.
    pub fn with_default_providers() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(openai::OpenAiFactory));
        registry.register(Arc::new(anthropic::AnthropicFactory));
        registry.register(Arc::new(gemini::GeminiFactory));
        registry.register(Arc::new(perplexity::PerplexityFactory));
        registry.register(Arc::new(fallback::FallbackFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.provider(), factory);
    }

    pub fn create(
        &self,
        config: ModelConfig,
        secrets: Arc<SecretStoreService>,
    ) -> GatewayResult<Arc<dyn ModelAdapter>> {
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            GatewayError::Internal(format!(
                "no adapter factory registered for provider {}",
                config.provider
            ))
        })?;
        Ok(factory.create(config, secrets))
    }
}

/// Probes every adapter concurrently, bounding each probe by
/// [`HEALTH_CHECK_TIMEOUT`].
pub async fn health_check_all(
    adapters: &HashMap<String, Arc<dyn ModelAdapter>>,
) -> HashMap<String, HealthCheckResult> {
    let probes = adapters.iter().map(|(model_id, adapter)| {
        let model_id = model_id.clone();
        let adapter = adapter.clone();
        async move {
            let result =
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, adapter.health_check()).await {
                    Ok(result) => result,
                    Err(_) => HealthCheckResult::unhealthy("health check timed out"),
                };
            (model_id, result)
        }
    });
    futures::future::join_all(probes).await.into_iter().collect()
}
