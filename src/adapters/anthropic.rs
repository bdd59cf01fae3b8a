//! Anthropic messages-API adapter.
//!
//! Anthropic authenticates with an `x-api-key` header plus a pinned
//! `anthropic-version`, requires `max_tokens`, and returns content as a
//! list of typed blocks. Streaming uses named SSE events; only
//! `content_block_delta` carries text.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::sse::{sse_stream, SseEvent};
use super::{ApiKeyCache, ChunkStream, ModelAdapter, PROVIDER_TIMEOUT};
use crate::config::ModelConfig;
use crate::cost::{estimate_tokens, CostEstimator};
use crate::secrets::SecretStoreService;
use crate::types::{AdapterRequest, AdapterResponse, ChatMessage, HealthCheckResult, ProviderKind};
use crate::{AdapterFactory, GatewayError, GatewayResult, ProviderFailure};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

pub struct AnthropicAdapter {
    config: ModelConfig,
    key: ApiKeyCache,
    client: reqwest::Client,
    estimator: CostEstimator,
}

impl AnthropicAdapter {
    pub fn new(config: ModelConfig, secrets: Arc<SecretStoreService>) -> Self {
        let key = ApiKeyCache::new(secrets, config.api_key_secret_ref.clone());
        Self {
            config,
            key,
            client: reqwest::Client::new(),
            estimator: CostEstimator::new(),
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn build_body(&self, request: &AdapterRequest, stream: bool) -> MessagesRequest {
        // The messages API has no response_format knob; the JSON hint
        // becomes a system instruction instead.
        let system = request
            .json_response
            .then(|| "Respond with a single valid JSON object and nothing else.".to_string());
        MessagesRequest {
            model: self.config.model_name.clone(),
            messages: vec![ChatMessage::user(&request.prompt)],
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
            system,
            stream,
        }
    }

    async fn send(
        &self,
        request: &AdapterRequest,
        stream: bool,
    ) -> GatewayResult<reqwest::Response> {
        let api_key = self.key.get().await?;
        let body = self.build_body(request, stream);
        let url = format!("{}/v1/messages", self.base_url());
        debug!(model_id = %self.config.model_id, url = %url, "anthropic request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Network, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            error!(model_id = %self.config.model_id, status, "anthropic api error");
            return Err(GatewayError::provider(
                ProviderFailure::Api,
                format!("anthropic returned {status}: {message}"),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(&self, request: &AdapterRequest) -> GatewayResult<AdapterResponse> {
        let started = Instant::now();
        let response = self.send(request, false).await?;

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Decode, e.to_string()))?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let (input_tokens, output_tokens) = match parsed.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (estimate_tokens(&request.prompt), estimate_tokens(&content)),
        };

        Ok(AdapterResponse {
            content,
            model_used: parsed.model,
            provider: ProviderKind::Anthropic,
            tokens_used: input_tokens + output_tokens,
            cost_estimate: self
                .estimator
                .completion_cost(&self.config, input_tokens, output_tokens),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: AdapterRequest) -> GatewayResult<ChunkStream> {
        let response = self.send(&request, true).await?;

        let chunks = sse_stream(response).filter_map(|event| async move {
            match event {
                Ok(event) => decode_stream_event(&event).map(Ok),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let api_key = match self.key.get().await {
            Ok(key) => key,
            Err(e) => return HealthCheckResult::unhealthy(e.to_string()),
        };

        // Minimal one-token completion; there is no cheaper authenticated
        // endpoint on this API.
        let probe = MessagesRequest {
            model: self.config.model_name.clone(),
            messages: vec![ChatMessage::user("ping")],
            max_tokens: 1,
            temperature: None,
            system: None,
            stream: false,
        };
        let url = format!("{}/v1/messages", self.base_url());
        match self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&probe)
            .timeout(super::HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                HealthCheckResult::healthy(started.elapsed().as_millis() as u64)
            }
            Ok(response) => HealthCheckResult::unhealthy(format!("status {}", response.status())),
            Err(e) => HealthCheckResult::unhealthy(e.to_string()),
        }
    }

    fn estimate_cost(&self, prompt: &str, max_tokens: u32) -> f64 {
        self.estimator
            .estimate_for_model(&self.config, prompt, max_tokens)
    }
}

fn decode_stream_event(event: &SseEvent) -> Option<String> {
    let parsed: StreamEvent = serde_json::from_str(&event.data).ok()?;
    if parsed.event_type != "content_block_delta" {
        return None;
    }
    parsed
        .delta
        .and_then(|delta| delta.text)
        .filter(|text| !text.is_empty())
}

pub struct AnthropicFactory;

impl AdapterFactory for AnthropicFactory {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn create(
        &self,
        config: ModelConfig,
        secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter> {
        Arc::new(AnthropicAdapter::new(config, secrets))
    }
}
