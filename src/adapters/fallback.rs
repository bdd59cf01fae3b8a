//! Deterministic fallback adapter of last resort.
//!
//! Synthesizes a response by picking from a small phrase pool keyed on a
//! hash of the prompt, reports zero cost, and is always healthy. The
//! gateway keeps one of these registered at all times so degraded service
//! beats no service.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChunkStream, ModelAdapter};
use crate::config::ModelConfig;
use crate::cost::estimate_tokens;
use crate::secrets::{SecretReference, SecretStoreService};
use crate::types::{AdapterRequest, AdapterResponse, HealthCheckResult, ProviderKind};
use crate::{AdapterFactory, GatewayResult};

/// Model id the gateway registers the built-in fallback under.
pub const FALLBACK_MODEL_ID: &str = "fallback";

const PHRASES: &[&str] = &[
    "I'm currently running in fallback mode. Please configure an LLM provider for full functionality.",
    "Thank you for your question. The AI service is temporarily unavailable, but I can provide basic assistance.",
    "I'm here to help! Currently operating in limited mode - please check back soon for full AI capabilities.",
];

/// Configuration used when no fallback model is declared by the admin.
pub fn default_fallback_config() -> ModelConfig {
    let mut config = ModelConfig::new(
        FALLBACK_MODEL_ID,
        ProviderKind::Fallback,
        FALLBACK_MODEL_ID,
        SecretReference::env("FALLBACK_KEY"),
    );
    config.priority = crate::config::ModelPriority::Fallback;
    config.cost_per_token = 0.0;
    config
}

pub struct FallbackAdapter {
    config: ModelConfig,
}

impl FallbackAdapter {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    fn pick_phrase(prompt: &str) -> &'static str {
        let digest = Sha256::digest(prompt.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(prefix) % PHRASES.len() as u64) as usize;
        PHRASES[index]
    }
}

#[async_trait]
impl ModelAdapter for FallbackAdapter {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Fallback
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(&self, request: &AdapterRequest) -> GatewayResult<AdapterResponse> {
        let started = Instant::now();
        let content = Self::pick_phrase(&request.prompt).to_string();
        let tokens_used = estimate_tokens(&request.prompt) + estimate_tokens(&content);

        Ok(AdapterResponse {
            content,
            model_used: self.config.model_name.clone(),
            provider: ProviderKind::Fallback,
            tokens_used,
            cost_estimate: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: AdapterRequest) -> GatewayResult<ChunkStream> {
        let content = Self::pick_phrase(&request.prompt);
        let words: Vec<GatewayResult<String>> = content
            .split_whitespace()
            .map(|word| Ok(format!("{word} ")))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }

    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult::healthy(0)
    }

    fn estimate_cost(&self, _prompt: &str, _max_tokens: u32) -> f64 {
        0.0
    }
}

pub struct FallbackFactory;

impl AdapterFactory for FallbackFactory {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Fallback
    }

    fn create(
        &self,
        config: ModelConfig,
        _secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter> {
        Arc::new(FallbackAdapter::new(config))
    }
}
