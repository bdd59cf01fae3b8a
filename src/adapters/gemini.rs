//! Google Gemini adapter.
//!
//! Gemini takes the API key as a query parameter, wraps the conversation in
//! `contents` with typed parts, and tucks sampling knobs into a
//! `generationConfig` object. Streaming uses `streamGenerateContent` with
//! `alt=sse`.

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
use crate::types::{AdapterRequest, AdapterResponse, HealthCheckResult, ProviderKind};
use crate::{AdapterFactory, GatewayError, GatewayResult, ProviderFailure};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

pub struct GeminiAdapter {
    config: ModelConfig,
    key: ApiKeyCache,
    client: reqwest::Client,
    estimator: CostEstimator,
}

impl GeminiAdapter {
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

    fn build_body(&self, request: &AdapterRequest) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(request.prompt.clone()),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
                temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
                response_mime_type: request
                    .json_response
                    .then(|| "application/json".to_string()),
            },
        }
    }

    async fn send(&self, request: &AdapterRequest, stream: bool) -> GatewayResult<reqwest::Response> {
        let api_key = self.key.get().await?;
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!(
            "{}/models/{}:{}?key={}",
            self.base_url(),
            self.config.model_name,
            method,
            api_key
        );
        if stream {
            url.push_str("&alt=sse");
        }
        debug!(model_id = %self.config.model_id, method, "gemini request");

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Network, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(model_id = %self.config.model_id, status, "gemini api error");
            return Err(GatewayError::provider(
                ProviderFailure::Api,
                format!("gemini returned {status}: {body}"),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelAdapter for GeminiAdapter {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn generate(&self, request: &AdapterRequest) -> GatewayResult<AdapterResponse> {
        let started = Instant::now();
        let response = self.send(request, false).await?;

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(ProviderFailure::Decode, e.to_string()))?;

        let content = extract_text(&parsed);

        let (input_tokens, output_tokens) = match parsed.usage_metadata {
            Some(usage) => (usage.prompt_token_count, usage.candidates_token_count),
            None => (estimate_tokens(&request.prompt), estimate_tokens(&content)),
        };

        Ok(AdapterResponse {
            content,
            model_used: self.config.model_name.clone(),
            provider: ProviderKind::Gemini,
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

        let url = format!("{}/models?key={}&pageSize=1", self.base_url(), api_key);
        match self
            .client
            .get(&url)
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

fn extract_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect()
}

fn decode_stream_event(event: &SseEvent) -> Option<String> {
    let parsed: GenerateContentResponse = serde_json::from_str(&event.data).ok()?;
    let text = extract_text(&parsed);
    (!text.is_empty()).then_some(text)
}

pub struct GeminiFactory;

impl AdapterFactory for GeminiFactory {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn create(
        &self,
        config: ModelConfig,
        secrets: Arc<SecretStoreService>,
    ) -> Arc<dyn ModelAdapter> {
        Arc::new(GeminiAdapter::new(config, secrets))
    }
}
