//! Request and response types shared across the gateway pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{GatewayError, GatewayResult};

/// Upper bound on prompt length, in characters.
pub const MAX_PROMPT_CHARS: usize = 50_000;
/// Upper bound on requested output tokens.
pub const MAX_OUTPUT_TOKENS: u32 = 32_000;
/// Inclusive temperature range accepted from callers.
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);

/// LLM providers the gateway can route to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Perplexity,
    Fallback,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::Perplexity => write!(f, "perplexity"),
            ProviderKind::Fallback => write!(f, "fallback"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            "perplexity" => Ok(ProviderKind::Perplexity),
            "fallback" => Ok(ProviderKind::Fallback),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown provider kind: {other}"
            ))),
        }
    }
}

/// Message roles understood by all provider wire formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a provider conversation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Inbound request as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub prompt: String,
    pub user_id: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub user_tier: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GatewayRequest {
    pub fn new(prompt: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            user_id: user_id.into(),
            task_type: None,
            user_tier: None,
            session_id: None,
            max_tokens: None,
            temperature: None,
            stream: false,
            priority: 0,
            metadata: HashMap::new(),
        }
    }
}

/// Response returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub content: String,
    pub model_used: String,
    pub provider: String,
    pub request_id: String,
    pub tokens_used: u32,
    pub cost_estimate: f64,
    pub latency_ms: u64,
    pub cached: bool,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Enriched request handed to the router and adapters. Produced by
/// [`enrich`] after validation; the prompt is whitespace-normalized and the
/// request carries its identity and context.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub request_id: String,
    pub prompt: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub task_type: Option<String>,
    pub user_tier: Option<String>,
    pub priority: i32,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    /// Caller asked for a JSON-formatted response body.
    pub json_response: bool,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Uniform response produced by a provider adapter.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub content: String,
    pub model_used: String,
    pub provider: ProviderKind,
    pub tokens_used: u32,
    pub cost_estimate: f64,
    pub latency_ms: u64,
}

/// Outcome of probing a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Collapses whitespace runs into single spaces and trims the ends.
pub fn normalize_prompt(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validates field bounds and produces the enriched request the rest of the
/// pipeline operates on.
pub fn enrich(request: &GatewayRequest) -> GatewayResult<AdapterRequest> {
    if request.prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(GatewayError::InvalidRequest(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }

    let prompt = normalize_prompt(&request.prompt);
    if prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("prompt is empty".into()));
    }

    if let Some(max_tokens) = request.max_tokens {
        if max_tokens == 0 || max_tokens > MAX_OUTPUT_TOKENS {
            return Err(GatewayError::InvalidRequest(format!(
                "max_tokens must be within 1..={MAX_OUTPUT_TOKENS}"
            )));
        }
    }

    if let Some(temperature) = request.temperature {
        let (lo, hi) = TEMPERATURE_RANGE;
        if !(lo..=hi).contains(&temperature) || temperature.is_nan() {
            return Err(GatewayError::InvalidRequest(format!(
                "temperature must be within {lo}..={hi}"
            )));
        }
    }

    if request.user_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("user_id is required".into()));
    }

    let json_response = request
        .metadata
        .get("response_format")
        .and_then(|v| v.as_str())
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    Ok(AdapterRequest {
        request_id: Uuid::new_v4().to_string(),
        prompt,
        user_id: request.user_id.clone(),
        session_id: request.session_id.clone(),
        task_type: request.task_type.clone(),
        user_tier: request.user_tier.clone(),
        priority: request.priority,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: request.stream,
        json_response,
        timestamp: Utc::now(),
        metadata: request.metadata.clone(),
    })
}
