//! Secret store clients.
//!
//! Provider API keys are never stored in configuration; model configs carry
//! an opaque [`SecretReference`] that is resolved lazily through a
//! [`SecretStoreService`]. Client implementations are pluggable per
//! provider kind: managed cloud vaults (Azure Key Vault, GCP Secret
//! Manager), a self-hosted HashiCorp Vault, or local environment variables
//! for development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{GatewayError, GatewayResult, ProviderFailure};

/// Default time a resolved secret stays cached before a re-fetch.
pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(3600);

/// Secret store backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SecretProvider {
    /// Azure Key Vault.
    Azure,
    /// GCP Secret Manager.
    Gcp,
    /// Self-hosted HashiCorp Vault (KV v2).
    Vault,
    /// Local environment variables; development only.
    Env,
}

impl std::fmt::Display for SecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretProvider::Azure => write!(f, "azure"),
            SecretProvider::Gcp => write!(f, "gcp"),
            SecretProvider::Vault => write!(f, "vault"),
            SecretProvider::Env => write!(f, "env"),
        }
    }
}

impl std::str::FromStr for SecretProvider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azure" => Ok(SecretProvider::Azure),
            "gcp" => Ok(SecretProvider::Gcp),
            "vault" | "hashicorp" => Ok(SecretProvider::Vault),
            "env" | "local" => Ok(SecretProvider::Env),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown secret provider: {other}"
            ))),
        }
    }
}

/// Opaque handle to an API key held by a secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretReference {
    pub provider: SecretProvider,
    pub secret_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SecretReference {
    pub fn env(name: impl Into<String>) -> Self {
        Self {
            provider: SecretProvider::Env,
            secret_identifier: name.into(),
            version: None,
        }
    }

    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider,
            self.secret_identifier,
            self.version.as_deref().unwrap_or("latest")
        )
    }
}

/// Contract all secret store clients implement. `health_check` must be
/// cheap; it is called during service initialization and from the status
/// surface.
#[async_trait]
pub trait SecretVaultClient: Send + Sync {
    async fn get_secret(&self, identifier: &str, version: Option<&str>) -> GatewayResult<String>;

    async fn health_check(&self) -> bool;
}

fn secret_error(message: impl Into<String>) -> GatewayError {
    GatewayError::provider(ProviderFailure::SecretFetch, message)
}

/// Reads secrets from process environment variables.
pub struct EnvSecrets;

#[async_trait]
impl SecretVaultClient for EnvSecrets {
    async fn get_secret(&self, identifier: &str, _version: Option<&str>) -> GatewayResult<String> {
        std::env::var(identifier)
            .map_err(|_| secret_error(format!("environment variable {identifier} not set")))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// HashiCorp Vault KV v2 client.
pub struct VaultSecrets {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl VaultSecrets {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SecretVaultClient for VaultSecrets {
    async fn get_secret(&self, identifier: &str, version: Option<&str>) -> GatewayResult<String> {
        let mut url = format!(
            "{}/v1/secret/data/{}",
            self.base_url.trim_end_matches('/'),
            identifier
        );
        if let Some(version) = version {
            url.push_str(&format!("?version={version}"));
        }

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| secret_error(format!("vault request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(secret_error(format!(
                "vault returned {} for {identifier}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| secret_error(format!("vault response decode failed: {e}")))?;

        body["data"]["data"]["value"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| secret_error(format!("vault secret {identifier} has no `value` field")))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/sys/health", self.base_url.trim_end_matches('/'));
        matches!(
            self.client
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }
}

/// Azure Key Vault REST client. Expects a pre-acquired bearer token; token
/// acquisition belongs to the deployment environment.
pub struct AzureSecrets {
    vault_url: String,
    access_token: String,
    client: reqwest::Client,
}

impl AzureSecrets {
    pub fn new(vault_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            vault_url: vault_url.into(),
            access_token: access_token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SecretVaultClient for AzureSecrets {
    async fn get_secret(&self, identifier: &str, version: Option<&str>) -> GatewayResult<String> {
        let base = self.vault_url.trim_end_matches('/');
        let url = match version {
            Some(version) => format!("{base}/secrets/{identifier}/{version}?api-version=7.4"),
            None => format!("{base}/secrets/{identifier}?api-version=7.4"),
        };

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| secret_error(format!("azure key vault request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(secret_error(format!(
                "azure key vault returned {} for {identifier}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| secret_error(format!("azure key vault decode failed: {e}")))?;

        body["value"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| secret_error(format!("azure secret {identifier} has no value")))
    }

    async fn health_check(&self) -> bool {
        // An unauthorized response still proves the vault endpoint is
        // reachable, which is all this probe claims.
        let url = format!(
            "{}/secrets?api-version=7.4&maxresults=1",
            self.vault_url.trim_end_matches('/')
        );
        self.client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}

/// GCP Secret Manager REST client. The identifier is the full resource name
/// (`projects/<p>/secrets/<name>`).
pub struct GcpSecrets {
    access_token: String,
    client: reqwest::Client,
}

impl GcpSecrets {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SecretVaultClient for GcpSecrets {
    async fn get_secret(&self, identifier: &str, version: Option<&str>) -> GatewayResult<String> {
        let version = version.unwrap_or("latest");
        let url = format!(
            "https://secretmanager.googleapis.com/v1/{identifier}/versions/{version}:access"
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| secret_error(format!("gcp secret manager request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(secret_error(format!(
                "gcp secret manager returned {} for {identifier}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| secret_error(format!("gcp secret manager decode failed: {e}")))?;

        let encoded = body["payload"]["data"]
            .as_str()
            .ok_or_else(|| secret_error(format!("gcp secret {identifier} has no payload")))?;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| secret_error(format!("gcp secret payload is not base64: {e}")))?;

        String::from_utf8(raw)
            .map_err(|e| secret_error(format!("gcp secret payload is not UTF-8: {e}")))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get("https://secretmanager.googleapis.com/v1/projects/-/secrets")
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}

struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

/// Unified secret resolution with a per-reference TTL cache. Failed lookups
/// are never cached.
pub struct SecretStoreService {
    clients: HashMap<SecretProvider, Arc<dyn SecretVaultClient>>,
    cache: DashMap<String, CachedSecret>,
    ttl: Duration,
}

impl SecretStoreService {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SECRET_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn register_client(&mut self, provider: SecretProvider, client: Arc<dyn SecretVaultClient>) {
        info!(provider = %provider, "registered secret store client");
        self.clients.insert(provider, client);
    }

    /// Builds the service from `SECRET_STORE_KIND` and the selected store's
    /// credential variables. The env-backed client is always registered so
    /// `env`-kind references keep working in every deployment.
    pub fn from_env() -> Self {
        let mut service = Self::new();
        service.register_client(SecretProvider::Env, Arc::new(EnvSecrets));

        let kind = std::env::var("SECRET_STORE_KIND").unwrap_or_else(|_| "env".to_string());
        match kind.parse::<SecretProvider>() {
            Ok(SecretProvider::Vault) => {
                match (std::env::var("VAULT_ADDR"), std::env::var("VAULT_TOKEN")) {
                    (Ok(addr), Ok(token)) => {
                        service.register_client(
                            SecretProvider::Vault,
                            Arc::new(VaultSecrets::new(addr, token)),
                        );
                    }
                    _ => warn!("SECRET_STORE_KIND=vault but VAULT_ADDR/VAULT_TOKEN are not set"),
                }
            }
            Ok(SecretProvider::Azure) => {
                match (
                    std::env::var("AZURE_VAULT_URL"),
                    std::env::var("AZURE_VAULT_TOKEN"),
                ) {
                    (Ok(url), Ok(token)) => {
                        service.register_client(
                            SecretProvider::Azure,
                            Arc::new(AzureSecrets::new(url, token)),
                        );
                    }
                    _ => warn!(
                        "SECRET_STORE_KIND=azure but AZURE_VAULT_URL/AZURE_VAULT_TOKEN are not set"
                    ),
                }
            }
            Ok(SecretProvider::Gcp) => match std::env::var("GCP_ACCESS_TOKEN") {
                Ok(token) => {
                    service
                        .register_client(SecretProvider::Gcp, Arc::new(GcpSecrets::new(token)));
                }
                _ => warn!("SECRET_STORE_KIND=gcp but GCP_ACCESS_TOKEN is not set"),
            },
            Ok(SecretProvider::Env) => {}
            Err(_) => warn!(kind = %kind, "unrecognized SECRET_STORE_KIND, using env store"),
        }

        service
    }

    pub async fn get_secret(&self, reference: &SecretReference) -> GatewayResult<String> {
        let cache_key = reference.cache_key();

        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(secret = %reference.secret_identifier, "secret cache hit");
                return Ok(entry.value.clone());
            }
        }

        let client = self.clients.get(&reference.provider).ok_or_else(|| {
            secret_error(format!(
                "no client registered for secret provider {}",
                reference.provider
            ))
        })?;

        match client
            .get_secret(&reference.secret_identifier, reference.version.as_deref())
            .await
        {
            Ok(value) => {
                self.cache.insert(
                    cache_key,
                    CachedSecret {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                debug!(secret = %reference.secret_identifier, "resolved secret");
                Ok(value)
            }
            Err(e) => {
                error!(secret = %reference.secret_identifier, error = %e, "secret fetch failed");
                Err(e)
            }
        }
    }

    pub async fn health_check_all(&self) -> HashMap<SecretProvider, bool> {
        let mut results = HashMap::new();
        for (provider, client) in &self.clients {
            results.insert(*provider, client.health_check().await);
        }
        results
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl Default for SecretStoreService {
    fn default() -> Self {
        Self::new()
    }
}
