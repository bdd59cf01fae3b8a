//! OpenAI chat-completions adapter.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

pub struct OpenAiAdapter {
    config: ModelConfig,
    key: ApiKeyCache,
    client: reqwest::Client,
    estimator: CostEstimator,
}

impl OpenAiAdapter {
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

    fn build_body(&self, request: &AdapterRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: vec![ChatMessage::user(&request.prompt)],
            max_tokens: Some(request.max_tokens.unwrap_or(self.config.max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
            stream,
            response_format: request.json_response.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }

    fn error_from_status(&self, status: u16, body: &str) -> GatewayError {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());
        error!(model_id = %self.config.model_id, status, "openai api error");
        GatewayError::provider(
            ProviderFailure::Api,
            format!("openai returned {status}: {message}"),
        )
    }

    async fn send(
        &self,
        request: &AdapterRequest,
        stream: bool,
    ) -> GatewayResult<reqwest::Response> {
        let api_key = self.key.get().await?;
        let body = self.build_body(request, stream);
        let url = format!("{}/chat/completions", self.base_url());
        debug!(model_id = %self.config.model_id, url = %url, "openai request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Network, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(self.error_from_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(&self, request: &AdapterRequest) -> GatewayResult<AdapterResponse> {
        let started = Instant::now();
        let response = self.send(request, false).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Decode, e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let (input_tokens, output_tokens, total_tokens) = match parsed.usage {
            Some(usage) => (
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
            ),
            None => {
                let input = estimate_tokens(&request.prompt);
                let output = estimate_tokens(&content);
                (input, output, input + output)
            }
        };

        Ok(AdapterResponse {
            content,
            model_used: parsed.model,
            provider: ProviderKind::OpenAi,
            tokens_used: total_tokens,
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

        let url = format!("{}/models", self.base_url());
        match self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .timeout(super::HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                HealthCheckResult::healthy(started.elapsed().as_millis() as u64)
            }
            Ok(response) => {
                HealthCheckResult::unhealthy(format!("status {}", response.status()))
            }
            Err(e) => HealthCheckResult::unhealthy(e.to_string()),
        }
    }

    fn estimate_cost(&self, prompt: &str, max_tokens: u32) -> f64 {
        self.estimator
            .estimate_for_model(&self.config, prompt, max_tokens)
    }
}

/// Decodes one SSE event into a content chunk; `[DONE]` and empty deltas
/// yield nothing.
fn decode_stream_event(event: &SseEvent) -> Option<String> {
    if event.data.trim() == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(&event.data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
}

pub struct OpenAiFactory;

impl AdapterFactory for OpenAiFactory {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn create(
        &self,
        config: ModelConfig,
        secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter> {
        Arc::new(OpenAiAdapter::new(config, secrets))
    }
}
