//! # Switchboard
//!
//! Switchboard is an LLM orchestration gateway: a single entry point that
//! accepts text-completion requests, selects a provider/model according to
//! admin policy, enforces cost budgets and rate limits, caches responses,
//! isolates failing providers behind circuit breakers and emits usage
//! analytics.
//!
//! The gateway does not own HTTP transport or authentication. It consumes
//! three collaborator interfaces: a secret store ([`secrets`]), a
//! configuration store ([`config`]) and an analytics sink ([`usage`]), and
//! exposes one request/response surface plus one streaming surface
//! ([`gateway::Gateway`]).

pub mod adapters;
pub mod breaker;
pub mod budget;
pub mod cache;
pub mod config;
pub mod cost;
pub mod gateway;
pub mod ratelimit;
pub mod router;
pub mod secrets;
pub mod types;
pub mod usage;

pub use adapters::{AdapterFactory, AdapterRegistry, ChunkStream, ModelAdapter};
pub use breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use budget::{BudgetAlert, BudgetStatus, BudgetTracker};
pub use cache::{CacheStats, ResponseCache};
pub use config::{
    AbTest, BudgetConfig, CachingConfig, ConditionKey, ConfigDocument, ConfigStore, ModelConfig,
    ModelPriority, ModelUpdate, RateLimitConfig, ResetPeriod, RoutingRule, UserTier,
};
pub use cost::{CostBreakdown, CostEstimator};
pub use gateway::{Gateway, GatewayOptions, ProviderStatus, SystemStatus};
pub use router::{RouteContext, Router};
pub use secrets::{SecretProvider, SecretReference, SecretStoreService, SecretVaultClient};
pub use types::{
    AdapterRequest, AdapterResponse, ChatMessage, ChatRole, GatewayRequest, GatewayResponse,
    HealthCheckResult, ProviderKind,
};
pub use usage::{AnalyticsSink, MemoryAnalytics, UsageLogger, UsageRecord, UsageReport};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Classifies what went wrong inside a provider adapter. Carried alongside
/// the message so the gateway can distinguish a secret-store miss from a
/// wire-level failure when deciding whether to fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailure {
    /// The provider returned a non-success status or an error payload.
    Api,
    /// The request never completed at the transport level.
    Network,
    /// The API key could not be fetched from the secret store.
    SecretFetch,
    /// The provider's response could not be decoded.
    Decode,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFailure::Api => write!(f, "api"),
            ProviderFailure::Network => write!(f, "network"),
            ProviderFailure::SecretFetch => write!(f, "secret_fetch"),
            ProviderFailure::Decode => write!(f, "decode"),
        }
    }
}

/// Caller-visible error taxonomy for gateway operations.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway not initialized; call initialize() first")]
    NotInitialized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited on {scope} bucket")]
    RateLimited { scope: String },

    #[error("budget {budget_id} would be exceeded: {current_usage:.4} + estimate > {limit:.4}")]
    BudgetExceeded {
        budget_id: String,
        current_usage: f64,
        limit: f64,
        resets_at: DateTime<Utc>,
    },

    #[error("no healthy model available")]
    NoHealthyModel,

    #[error("deadline elapsed: {0}")]
    Timeout(String),

    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderFailure,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn provider(kind: ProviderFailure, message: impl Into<String>) -> Self {
        GatewayError::Provider {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error should be recorded as a failure against the
    /// selected model's circuit breaker.
    pub fn counts_as_provider_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Provider { .. } | GatewayError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {err}"))
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
