//! Configuration types and the admin-facing configuration store.
//!
//! The store is the canonical in-memory view of model, routing, A/B test,
//! budget, tier, caching and rate-limit configuration. The exportable
//! [`ConfigDocument`] is the authoritative wire format for backup,
//! migration and audit.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::secrets::SecretReference;
use crate::types::ProviderKind;
use crate::{GatewayError, GatewayResult};

/// Model selection priority. Lower numeric value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ModelPriority {
    Highest,
    High,
    Medium,
    Low,
    Fallback,
}

impl ModelPriority {
    pub fn value(self) -> u8 {
        match self {
            ModelPriority::Highest => 1,
            ModelPriority::High => 2,
            ModelPriority::Medium => 3,
            ModelPriority::Low => 4,
            ModelPriority::Fallback => 5,
        }
    }
}

impl Default for ModelPriority {
    fn default() -> Self {
        ModelPriority::Medium
    }
}

impl From<ModelPriority> for u8 {
    fn from(priority: ModelPriority) -> u8 {
        priority.value()
    }
}

impl TryFrom<u8> for ModelPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ModelPriority::Highest),
            2 => Ok(ModelPriority::High),
            3 => Ok(ModelPriority::Medium),
            4 => Ok(ModelPriority::Low),
            5 => Ok(ModelPriority::Fallback),
            other => Err(format!("priority must be 1..=5, got {other}")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cost_per_token() -> f64 {
    0.0001
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_context_window() -> u32 {
    8192
}

fn default_rate_limit_rpm() -> u32 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

/// Admin-supplied declaration of a usable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub provider: ProviderKind,
    /// Wire-level model name sent to the provider.
    pub model_name: String,
    pub api_key_secret_ref: SecretReference,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: ModelPriority,
    /// Blended USD cost per token, used when no per-1K split is configured.
    #[serde(default = "default_cost_per_token")]
    pub cost_per_token: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_output: Option<f64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub circuit_breaker_timeout_secs: u64,
    /// Base URL override for the provider endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ModelConfig {
    pub fn new(
        model_id: impl Into<String>,
        provider: ProviderKind,
        model_name: impl Into<String>,
        api_key_secret_ref: SecretReference,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider,
            model_name: model_name.into(),
            api_key_secret_ref,
            is_active: true,
            priority: ModelPriority::default(),
            cost_per_token: default_cost_per_token(),
            cost_per_1k_input: None,
            cost_per_1k_output: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window: default_context_window(),
            supports_streaming: true,
            rate_limit_rpm: default_rate_limit_rpm(),
            circuit_breaker_threshold: default_failure_threshold(),
            circuit_breaker_timeout_secs: default_recovery_timeout(),
            base_url: None,
            metadata: HashMap::new(),
        }
    }
}

/// Field-wise update applied to an existing model configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub priority: Option<ModelPriority>,
    pub cost_per_token: Option<f64>,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub context_window: Option<u32>,
    pub supports_streaming: Option<bool>,
    pub rate_limit_rpm: Option<u32>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_timeout_secs: Option<u64>,
    pub base_url: Option<String>,
}

/// Context keys a routing rule may condition on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKey {
    TaskType,
    UserTier,
    UserId,
    Priority,
}

impl std::str::FromStr for ConditionKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_type" => Ok(ConditionKey::TaskType),
            "user_tier" => Ok(ConditionKey::UserTier),
            "user_id" => Ok(ConditionKey::UserId),
            "priority" => Ok(ConditionKey::Priority),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown routing condition key: {other}"
            ))),
        }
    }
}

/// Admin-defined conditional preference for specific models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub name: String,
    /// Every condition must match the request context for the rule to apply.
    pub conditions: BTreeMap<ConditionKey, String>,
    /// Target model ids in priority order.
    pub target_models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

/// A/B test over model variants with deterministic user assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub test_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Variant name to traffic fraction; fractions must sum to 1.0.
    pub traffic_split: BTreeMap<String, f64>,
    /// Variant name to model ids in priority order.
    pub model_variants: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub success_metrics: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AbTest {
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.start_date <= now && now <= self.end_date
    }
}

/// Budget reset cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl ResetPeriod {
    /// End of the period that starts at `start`.
    pub fn period_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ResetPeriod::Daily => start + ChronoDuration::days(1),
            ResetPeriod::Weekly => start + ChronoDuration::weeks(1),
            ResetPeriod::Monthly => start + Months::new(1),
            ResetPeriod::Quarterly => start + Months::new(3),
        }
    }
}

impl std::str::FromStr for ResetPeriod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(ResetPeriod::Daily),
            "weekly" => Ok(ResetPeriod::Weekly),
            "monthly" => Ok(ResetPeriod::Monthly),
            "quarterly" => Ok(ResetPeriod::Quarterly),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown reset period: {other}"
            ))),
        }
    }
}

/// Scoped cost ceiling with a reset period. Empty `user_groups` means the
/// budget applies globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub budget_id: String,
    pub name: String,
    pub total_budget: f64,
    pub reset_period: ResetPeriod,
    /// Fractions of the limit at which alert events are emitted.
    #[serde(default)]
    pub alert_thresholds: Vec<f64>,
    #[serde(default = "default_true")]
    pub auto_disable_at_limit: bool,
    #[serde(default)]
    pub user_groups: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BudgetConfig {
    pub fn is_global(&self) -> bool {
        self.user_groups.is_empty()
    }
}

/// Named user class with access, priority and rate-limit modifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTier {
    pub tier_id: String,
    pub name: String,
    /// Model ids this tier may use; empty grants access to every model.
    #[serde(default)]
    pub model_access: Vec<String>,
    /// Subtracted from a model's effective priority for this tier.
    #[serde(default)]
    pub priority_boost: i32,
    #[serde(default = "default_multiplier")]
    pub rate_limit_multiplier: f64,
    /// Per-tier secret overrides keyed by model id.
    #[serde(default)]
    pub api_key_overrides: BTreeMap<String, SecretReference>,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Response cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Per-task-type TTL overrides, in seconds.
    #[serde(default)]
    pub task_ttl_overrides: BTreeMap<String, u64>,
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_entries() -> usize {
    10_000
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            task_ttl_overrides: BTreeMap::new(),
        }
    }
}

/// Rate limiting tuning. All rates are per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_rpm")]
    pub global_rpm: u32,
    #[serde(default = "default_user_rpm")]
    pub per_user_rpm: u32,
    /// Overrides the model's own `rate_limit_rpm` when present.
    #[serde(default)]
    pub per_model_rpm: BTreeMap<String, u32>,
    #[serde(default = "default_burst")]
    pub burst_allowance: u32,
}

fn default_global_rpm() -> u32 {
    1000
}

fn default_user_rpm() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rpm: default_global_rpm(),
            per_user_rpm: default_user_rpm(),
            per_model_rpm: BTreeMap::new(),
            burst_allowance: default_burst(),
        }
    }
}

/// The exportable configuration document (§ authoritative wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub routing_rules: BTreeMap<String, RoutingRule>,
    #[serde(default)]
    pub ab_tests: BTreeMap<String, AbTest>,
    #[serde(default)]
    pub budgets: BTreeMap<String, BudgetConfig>,
    #[serde(default)]
    pub user_tiers: BTreeMap<String, UserTier>,
    #[serde(default)]
    pub caching_config: CachingConfig,
    #[serde(default)]
    pub rate_limit_config: RateLimitConfig,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            routing_rules: BTreeMap::new(),
            ab_tests: BTreeMap::new(),
            budgets: BTreeMap::new(),
            user_tiers: BTreeMap::new(),
            caching_config: CachingConfig::default(),
            rate_limit_config: RateLimitConfig::default(),
        }
    }
}

#[derive(Default)]
struct ConfigState {
    models: BTreeMap<String, ModelConfig>,
    routing_rules: BTreeMap<String, RoutingRule>,
    ab_tests: BTreeMap<String, AbTest>,
    budgets: BTreeMap<String, BudgetConfig>,
    user_tiers: BTreeMap<String, UserTier>,
    caching: CachingConfig,
    rate_limits: RateLimitConfig,
}

/// Canonical store for gateway configuration. Reads take a shared lock;
/// admin mutations take the exclusive lock.
pub struct ConfigStore {
    state: RwLock<ConfigState>,
    document_path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConfigState::default()),
            document_path: None,
        }
    }

    /// A store backed by a JSON document on disk. `load_configurations`
    /// reads it; admin mutations write it back.
    pub fn with_document_path(path: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::new(ConfigState::default()),
            document_path: Some(path.into()),
        }
    }

    /// Loads configuration from the backing document, if one is configured.
    /// The in-memory view is consistent once this returns.
    pub async fn load_configurations(&self) -> GatewayResult<()> {
        let Some(path) = &self.document_path else {
            info!("no configuration document configured, starting empty");
            return Ok(());
        };

        if !path.exists() {
            warn!(path = %path.display(), "configuration document missing, starting empty");
            return Ok(());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Internal(format!("failed to read configuration: {e}")))?;
        let document: ConfigDocument = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Internal(format!("failed to parse configuration: {e}")))?;
        self.import(document).await?;
        info!(path = %path.display(), "loaded configuration document");
        Ok(())
    }

    /// Validates and installs a full configuration document.
    pub async fn import(&self, document: ConfigDocument) -> GatewayResult<()> {
        validate_document(&document)?;
        let mut state = self.state.write().await;
        state.models = document.models;
        state.routing_rules = document.routing_rules;
        state.ab_tests = document.ab_tests;
        state.budgets = document.budgets;
        state.user_tiers = document.user_tiers;
        state.caching = document.caching_config;
        state.rate_limits = document.rate_limit_config;
        Ok(())
    }

    pub async fn export(&self) -> ConfigDocument {
        let state = self.state.read().await;
        ConfigDocument {
            models: state.models.clone(),
            routing_rules: state.routing_rules.clone(),
            ab_tests: state.ab_tests.clone(),
            budgets: state.budgets.clone(),
            user_tiers: state.user_tiers.clone(),
            caching_config: state.caching.clone(),
            rate_limit_config: state.rate_limits.clone(),
        }
    }

    async fn persist(&self) -> GatewayResult<()> {
        let Some(path) = &self.document_path else {
            return Ok(());
        };
        let document = self.export().await;
        let raw = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, raw)
            .map_err(|e| GatewayError::Internal(format!("failed to persist configuration: {e}")))
    }

    // Model configuration

    pub async fn add_model(&self, config: ModelConfig) -> GatewayResult<()> {
        {
            let mut state = self.state.write().await;
            if state.models.contains_key(&config.model_id) {
                return Err(GatewayError::InvalidRequest(format!(
                    "model {} already exists",
                    config.model_id
                )));
            }
            info!(model_id = %config.model_id, provider = %config.provider, "added model configuration");
            state.models.insert(config.model_id.clone(), config);
        }
        self.persist().await
    }

    pub async fn update_model(&self, model_id: &str, update: ModelUpdate) -> GatewayResult<ModelConfig> {
        let updated = {
            let mut state = self.state.write().await;
            let config = state.models.get_mut(model_id).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("model {model_id} not found"))
            })?;

            if let Some(priority) = update.priority {
                config.priority = priority;
            }
            if let Some(v) = update.cost_per_token {
                config.cost_per_token = v;
            }
            if let Some(v) = update.cost_per_1k_input {
                config.cost_per_1k_input = Some(v);
            }
            if let Some(v) = update.cost_per_1k_output {
                config.cost_per_1k_output = Some(v);
            }
            if let Some(v) = update.max_tokens {
                config.max_tokens = v;
            }
            if let Some(v) = update.temperature {
                config.temperature = v;
            }
            if let Some(v) = update.context_window {
                config.context_window = v;
            }
            if let Some(v) = update.supports_streaming {
                config.supports_streaming = v;
            }
            if let Some(v) = update.rate_limit_rpm {
                config.rate_limit_rpm = v;
            }
            if let Some(v) = update.circuit_breaker_threshold {
                config.circuit_breaker_threshold = v;
            }
            if let Some(v) = update.circuit_breaker_timeout_secs {
                config.circuit_breaker_timeout_secs = v;
            }
            if let Some(v) = update.base_url {
                config.base_url = Some(v);
            }
            info!(model_id, "updated model configuration");
            config.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    pub async fn toggle_model(&self, model_id: &str, is_active: bool) -> GatewayResult<()> {
        {
            let mut state = self.state.write().await;
            let config = state.models.get_mut(model_id).ok_or_else(|| {
                GatewayError::InvalidRequest(format!("model {model_id} not found"))
            })?;
            config.is_active = is_active;
            info!(model_id, is_active, "toggled model");
        }
        self.persist().await
    }

    pub async fn model(&self, model_id: &str) -> Option<ModelConfig> {
        self.state.read().await.models.get(model_id).cloned()
    }

    pub async fn all_models(&self) -> Vec<ModelConfig> {
        self.state.read().await.models.values().cloned().collect()
    }

    pub async fn active_models(&self) -> Vec<ModelConfig> {
        self.state
            .read()
            .await
            .models
            .values()
            .filter(|m| m.is_active)
            .cloned()
            .collect()
    }

    // Routing rules

    pub async fn add_routing_rule(&self, rule: RoutingRule) -> GatewayResult<()> {
        if rule.target_models.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "routing rule {} has no target models",
                rule.rule_id
            )));
        }
        {
            let mut state = self.state.write().await;
            info!(rule_id = %rule.rule_id, "added routing rule");
            state.routing_rules.insert(rule.rule_id.clone(), rule);
        }
        self.persist().await
    }

    /// Active rules whose every condition matches the context, sorted by
    /// descending weight.
    pub async fn matching_rules(
        &self,
        context: &BTreeMap<ConditionKey, String>,
    ) -> Vec<RoutingRule> {
        let state = self.state.read().await;
        let mut matched: Vec<RoutingRule> = state
            .routing_rules
            .values()
            .filter(|rule| rule.is_active)
            .filter(|rule| {
                rule.conditions
                    .iter()
                    .all(|(key, expected)| context.get(key) == Some(expected))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matched
    }

    // A/B tests

    pub async fn create_ab_test(&self, test: AbTest) -> GatewayResult<()> {
        validate_ab_test(&test)?;
        {
            let mut state = self.state.write().await;
            info!(test_id = %test.test_id, "created A/B test");
            state.ab_tests.insert(test.test_id.clone(), test);
        }
        self.persist().await
    }

    pub async fn active_ab_tests(&self, now: DateTime<Utc>) -> Vec<AbTest> {
        self.state
            .read()
            .await
            .ab_tests
            .values()
            .filter(|t| t.is_running(now))
            .cloned()
            .collect()
    }

    // Budgets

    pub async fn create_budget(&self, budget: BudgetConfig) -> GatewayResult<()> {
        validate_budget(&budget)?;
        {
            let mut state = self.state.write().await;
            info!(budget_id = %budget.budget_id, "created budget");
            state.budgets.insert(budget.budget_id.clone(), budget);
        }
        self.persist().await
    }

    /// The most specific budget applicable to the given groups: the matching
    /// budget with the smallest group list, with global budgets losing to
    /// any group-scoped match.
    pub async fn budget_for_groups(&self, user_groups: &[String]) -> Option<BudgetConfig> {
        let state = self.state.read().await;
        state
            .budgets
            .values()
            .filter_map(|budget| {
                if budget.is_global() {
                    Some((budget, usize::MAX))
                } else if budget
                    .user_groups
                    .iter()
                    .any(|group| user_groups.contains(group))
                {
                    Some((budget, budget.user_groups.len()))
                } else {
                    None
                }
            })
            .min_by_key(|(_, specificity)| *specificity)
            .map(|(budget, _)| budget.clone())
    }

    /// The configured global budget (empty group list), if any.
    pub async fn global_budget(&self) -> Option<BudgetConfig> {
        self.state
            .read()
            .await
            .budgets
            .values()
            .find(|b| b.is_global())
            .cloned()
    }

    // User tiers

    pub async fn create_user_tier(&self, tier: UserTier) -> GatewayResult<()> {
        {
            let mut state = self.state.write().await;
            info!(tier_id = %tier.tier_id, "created user tier");
            state.user_tiers.insert(tier.tier_id.clone(), tier);
        }
        self.persist().await
    }

    pub async fn user_tier(&self, tier_id: &str) -> Option<UserTier> {
        self.state.read().await.user_tiers.get(tier_id).cloned()
    }

    // Caching / rate limits

    pub async fn caching_config(&self) -> CachingConfig {
        self.state.read().await.caching.clone()
    }

    pub async fn set_caching_config(&self, config: CachingConfig) -> GatewayResult<()> {
        self.state.write().await.caching = config;
        self.persist().await
    }

    pub async fn rate_limit_config(&self) -> RateLimitConfig {
        self.state.read().await.rate_limits.clone()
    }

    pub async fn set_rate_limit_config(&self, config: RateLimitConfig) -> GatewayResult<()> {
        self.state.write().await.rate_limits = config;
        self.persist().await
    }

    /// Per-minute rate for a model: the global override table wins over the
    /// model's own setting.
    pub async fn model_rpm(&self, config: &ModelConfig) -> u32 {
        self.state
            .read()
            .await
            .rate_limits
            .per_model_rpm
            .get(&config.model_id)
            .copied()
            .unwrap_or(config.rate_limit_rpm)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_document(document: &ConfigDocument) -> GatewayResult<()> {
    for (model_id, model) in &document.models {
        if model_id != &model.model_id {
            return Err(GatewayError::InvalidRequest(format!(
                "model key {model_id} does not match model_id {}",
                model.model_id
            )));
        }
    }
    for test in document.ab_tests.values() {
        validate_ab_test(test)?;
    }
    for budget in document.budgets.values() {
        validate_budget(budget)?;
    }
    Ok(())
}

fn validate_ab_test(test: &AbTest) -> GatewayResult<()> {
    let total: f64 = test.traffic_split.values().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(GatewayError::InvalidRequest(format!(
            "A/B test {} traffic split sums to {total}, expected 1.0",
            test.test_id
        )));
    }
    for variant in test.traffic_split.keys() {
        if !test.model_variants.contains_key(variant) {
            return Err(GatewayError::InvalidRequest(format!(
                "A/B test {} variant {variant} has no model list",
                test.test_id
            )));
        }
    }
    if test.end_date <= test.start_date {
        return Err(GatewayError::InvalidRequest(format!(
            "A/B test {} window is empty",
            test.test_id
        )));
    }
    Ok(())
}

fn validate_budget(budget: &BudgetConfig) -> GatewayResult<()> {
    if budget.total_budget <= 0.0 {
        return Err(GatewayError::InvalidRequest(format!(
            "budget {} limit must be positive",
            budget.budget_id
        )));
    }
    for threshold in &budget.alert_thresholds {
        if !(0.0..=1.0).contains(threshold) {
            return Err(GatewayError::InvalidRequest(format!(
                "budget {} alert threshold {threshold} outside [0, 1]",
                budget.budget_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretReference;

    fn sample_model(id: &str) -> ModelConfig {
        ModelConfig::new(
            id,
            ProviderKind::OpenAi,
            "gpt-4o",
            SecretReference::env("OPENAI_API_KEY"),
        )
    }

    fn sample_budget(id: &str, groups: &[&str]) -> BudgetConfig {
        BudgetConfig {
            budget_id: id.into(),
            name: id.into(),
            total_budget: 100.0,
            reset_period: ResetPeriod::Monthly,
            alert_thresholds: vec![0.5, 0.8],
            auto_disable_at_limit: true,
            user_groups: groups.iter().map(|g| g.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn export_import_round_trips() {
        let store = ConfigStore::new();
        store.add_model(sample_model("m1")).await.unwrap();
        store.create_budget(sample_budget("b1", &["premium"])).await.unwrap();
        store
            .add_routing_rule(RoutingRule {
                rule_id: "r1".into(),
                name: "coding".into(),
                conditions: BTreeMap::from([(ConditionKey::TaskType, "coding".into())]),
                target_models: vec!["m1".into()],
                weight: 2.0,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let exported = store.export().await;
        let json = serde_json::to_string(&exported).unwrap();
        let reparsed: ConfigDocument = serde_json::from_str(&json).unwrap();

        let second = ConfigStore::new();
        second.import(reparsed).await.unwrap();
        let re_exported = second.export().await;

        assert_eq!(
            serde_json::to_value(&exported).unwrap(),
            serde_json::to_value(&re_exported).unwrap()
        );
    }

    #[tokio::test]
    async fn duplicate_model_rejected() {
        let store = ConfigStore::new();
        store.add_model(sample_model("m1")).await.unwrap();
        assert!(store.add_model(sample_model("m1")).await.is_err());
    }

    #[tokio::test]
    async fn matching_rules_sorted_by_weight() {
        let store = ConfigStore::new();
        for (id, weight) in [("low", 1.0), ("high", 5.0)] {
            store
                .add_routing_rule(RoutingRule {
                    rule_id: id.into(),
                    name: id.into(),
                    conditions: BTreeMap::from([(ConditionKey::TaskType, "chat".into())]),
                    target_models: vec!["m1".into()],
                    weight,
                    is_active: true,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let context = BTreeMap::from([(ConditionKey::TaskType, "chat".to_string())]);
        let rules = store.matching_rules(&context).await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_id, "high");
    }

    #[tokio::test]
    async fn rule_requires_all_conditions() {
        let store = ConfigStore::new();
        store
            .add_routing_rule(RoutingRule {
                rule_id: "r1".into(),
                name: "premium coding".into(),
                conditions: BTreeMap::from([
                    (ConditionKey::TaskType, "coding".into()),
                    (ConditionKey::UserTier, "premium".into()),
                ]),
                target_models: vec!["m1".into()],
                weight: 1.0,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let partial = BTreeMap::from([(ConditionKey::TaskType, "coding".to_string())]);
        assert!(store.matching_rules(&partial).await.is_empty());

        let full = BTreeMap::from([
            (ConditionKey::TaskType, "coding".to_string()),
            (ConditionKey::UserTier, "premium".to_string()),
        ]);
        assert_eq!(store.matching_rules(&full).await.len(), 1);
    }

    #[tokio::test]
    async fn most_specific_budget_wins() {
        let store = ConfigStore::new();
        store.create_budget(sample_budget("global", &[])).await.unwrap();
        store
            .create_budget(sample_budget("broad", &["premium", "staff", "beta"]))
            .await
            .unwrap();
        store
            .create_budget(sample_budget("narrow", &["premium"]))
            .await
            .unwrap();

        let budget = store
            .budget_for_groups(&["premium".to_string()])
            .await
            .unwrap();
        assert_eq!(budget.budget_id, "narrow");

        let fallback = store
            .budget_for_groups(&["unknown".to_string()])
            .await
            .unwrap();
        assert_eq!(fallback.budget_id, "global");
    }

    #[tokio::test]
    async fn ab_test_split_must_sum_to_one() {
        let store = ConfigStore::new();
        let test = AbTest {
            test_id: "t1".into(),
            name: "t1".into(),
            description: String::new(),
            is_active: true,
            start_date: Utc::now(),
            end_date: Utc::now() + ChronoDuration::days(7),
            traffic_split: BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.7)]),
            model_variants: BTreeMap::from([
                ("a".to_string(), vec!["m1".to_string()]),
                ("b".to_string(), vec!["m2".to_string()]),
            ]),
            success_metrics: vec![],
            metadata: HashMap::new(),
        };
        assert!(store.create_ab_test(test).await.is_err());
    }

    #[tokio::test]
    async fn update_model_applies_fields() {
        let store = ConfigStore::new();
        store.add_model(sample_model("m1")).await.unwrap();
        let updated = store
            .update_model(
                "m1",
                ModelUpdate {
                    priority: Some(ModelPriority::Highest),
                    max_tokens: Some(1024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, ModelPriority::Highest);
        assert_eq!(updated.max_tokens, 1024);
        assert_eq!(updated.temperature, default_temperature());
    }

    #[test]
    fn priority_serde_uses_numeric_levels() {
        let json = serde_json::to_string(&ModelPriority::Highest).unwrap();
        assert_eq!(json, "1");
        assert!(serde_json::from_str::<ModelPriority>("6").is_err());
    }

    #[test]
    fn reset_period_windows() {
        let start = Utc::now();
        assert_eq!(
            ResetPeriod::Daily.period_end(start) - start,
            ChronoDuration::days(1)
        );
        assert_eq!(
            ResetPeriod::Weekly.period_end(start) - start,
            ChronoDuration::weeks(1)
        );
        assert!(ResetPeriod::Quarterly.period_end(start) > ResetPeriod::Monthly.period_end(start));
    }
}
