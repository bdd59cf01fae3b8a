//! Model selection.
//!
//! Given the enriched request and the set of currently available models
//! (active, circuit-admissible, tier-allowed), selection walks a ladder:
//! A/B test assignment, then admin routing rules by weight, then
//! priority/tier scoring, then the first available model. Variant
//! assignment is a deterministic SHA-256 bucket so a (user, test) pair
//! always lands on the same variant while the test window is unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{ConditionKey, ConfigStore};
use crate::types::AdapterRequest;
use crate::{GatewayError, GatewayResult};

/// Request context the router and routing rules evaluate against.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub user_id: String,
    pub task_type: Option<String>,
    pub user_tier: Option<String>,
    pub priority: i32,
}

impl RouteContext {
    pub fn from_request(request: &AdapterRequest) -> Self {
        Self {
            user_id: request.user_id.clone(),
            task_type: request.task_type.clone(),
            user_tier: request.user_tier.clone(),
            priority: request.priority,
        }
    }

    fn condition_map(&self) -> BTreeMap<ConditionKey, String> {
        let mut map = BTreeMap::new();
        map.insert(ConditionKey::UserId, self.user_id.clone());
        map.insert(ConditionKey::Priority, self.priority.to_string());
        if let Some(task_type) = &self.task_type {
            map.insert(ConditionKey::TaskType, task_type.clone());
        }
        if let Some(user_tier) = &self.user_tier {
            map.insert(ConditionKey::UserTier, user_tier.clone());
        }
        map
    }
}

/// Deterministic variant assignment: the first eight bytes of
/// `sha256(user_id:test_id)` are reduced to a fraction in `[0, 1)` and
/// mapped onto the traffic-split CDF in variant-name order.
pub fn assign_variant(
    user_id: &str,
    test_id: &str,
    traffic_split: &BTreeMap<String, f64>,
) -> Option<String> {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(test_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = (u64::from_be_bytes(prefix) % 1_000_000) as f64 / 1_000_000.0;

    let mut cumulative = 0.0;
    for (variant, fraction) in traffic_split {
        cumulative += fraction;
        if bucket < cumulative {
            return Some(variant.clone());
        }
    }
    None
}

/// Selects a model id from the available set according to admin policy.
pub struct Router {
    config: Arc<ConfigStore>,
}

impl Router {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// `available` must already be filtered to active, circuit-admissible,
    /// tier-allowed models, in stable (sorted) order.
    pub async fn select_model(
        &self,
        context: &RouteContext,
        available: &[String],
    ) -> GatewayResult<String> {
        if available.is_empty() {
            return Err(GatewayError::NoHealthyModel);
        }

        if let Some(model_id) = self.ab_test_selection(context, available).await {
            debug!(model_id = %model_id, "A/B test selected model");
            return Ok(model_id);
        }

        if let Some(model_id) = self.rule_selection(context, available).await {
            debug!(model_id = %model_id, "routing rule selected model");
            return Ok(model_id);
        }

        if let Some(model_id) = self.priority_selection(context, available).await {
            debug!(model_id = %model_id, "priority selected model");
            return Ok(model_id);
        }

        Ok(available[0].clone())
    }

    async fn ab_test_selection(
        &self,
        context: &RouteContext,
        available: &[String],
    ) -> Option<String> {
        let tests = self.config.active_ab_tests(Utc::now()).await;
        for test in tests {
            let any_available = test
                .model_variants
                .values()
                .flatten()
                .any(|model_id| available.contains(model_id));
            if !any_available {
                continue;
            }

            let variant = assign_variant(&context.user_id, &test.test_id, &test.traffic_split)?;
            if let Some(models) = test.model_variants.get(&variant) {
                if let Some(model_id) = models.iter().find(|m| available.contains(m)) {
                    return Some(model_id.clone());
                }
            }
        }
        None
    }

    async fn rule_selection(&self, context: &RouteContext, available: &[String]) -> Option<String> {
        let rules = self.config.matching_rules(&context.condition_map()).await;
        for rule in rules {
            if let Some(model_id) = rule.target_models.iter().find(|m| available.contains(m)) {
                debug!(rule_id = %rule.rule_id, model_id = %model_id, "routing rule matched");
                return Some(model_id.clone());
            }
        }
        None
    }

    /// Lowest effective priority wins; the tier's boost is subtracted. Ties
    /// break alphabetically on model id.
    async fn priority_selection(
        &self,
        context: &RouteContext,
        available: &[String],
    ) -> Option<String> {
        let tier = match &context.user_tier {
            Some(tier_id) => self.config.user_tier(tier_id).await,
            None => None,
        };
        let boost = tier.as_ref().map(|t| t.priority_boost).unwrap_or(0);

        let mut scored = Vec::new();
        for model_id in available {
            let Some(config) = self.config.model(model_id).await else {
                continue;
            };
            if !config.is_active {
                continue;
            }
            let effective = config.priority.value() as i32 - boost;
            scored.push((effective, model_id.clone()));
        }

        scored.sort();
        scored.into_iter().next().map(|(_, model_id)| model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbTest, ModelConfig, ModelPriority, RoutingRule, UserTier};
    use crate::secrets::SecretReference;
    use crate::types::ProviderKind;
    use chrono::Duration;
    use std::collections::HashMap;

    fn model(id: &str, priority: ModelPriority) -> ModelConfig {
        let mut config = ModelConfig::new(
            id,
            ProviderKind::OpenAi,
            id,
            SecretReference::env("OPENAI_API_KEY"),
        );
        config.priority = priority;
        config
    }

    async fn store_with_models(models: Vec<ModelConfig>) -> Arc<ConfigStore> {
        let store = Arc::new(ConfigStore::new());
        for config in models {
            store.add_model(config).await.unwrap();
        }
        store
    }

    fn even_split_test(test_id: &str, a: &str, b: &str) -> AbTest {
        AbTest {
            test_id: test_id.into(),
            name: test_id.into(),
            description: String::new(),
            is_active: true,
            start_date: Utc::now() - Duration::hours(1),
            end_date: Utc::now() + Duration::hours(1),
            traffic_split: BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]),
            model_variants: BTreeMap::from([
                ("a".to_string(), vec![a.to_string()]),
                ("b".to_string(), vec![b.to_string()]),
            ]),
            success_metrics: vec![],
            metadata: HashMap::new(),
        }
    }

    fn context(user_id: &str) -> RouteContext {
        RouteContext {
            user_id: user_id.into(),
            task_type: None,
            user_tier: None,
            priority: 0,
        }
    }

    #[test]
    fn variant_assignment_is_stable() {
        let split = BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]);
        let first = assign_variant("u1", "t1", &split).unwrap();
        for _ in 0..50 {
            assert_eq!(assign_variant("u1", "t1", &split).unwrap(), first);
        }
    }

    #[test]
    fn variant_assignment_covers_all_variants() {
        let split = BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]);
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(assign_variant(&format!("user-{i}"), "t1", &split).unwrap());
        }
        assert_eq!(seen.len(), 2, "both variants should receive traffic");
    }

    #[test]
    fn full_weight_variant_takes_everything() {
        let split = BTreeMap::from([("only".to_string(), 1.0)]);
        for i in 0..50 {
            assert_eq!(
                assign_variant(&format!("user-{i}"), "t1", &split).unwrap(),
                "only"
            );
        }
    }

    #[tokio::test]
    async fn ab_test_takes_precedence_over_priority() {
        let store = store_with_models(vec![
            model("m1", ModelPriority::Highest),
            model("m2", ModelPriority::Low),
        ])
        .await;
        store
            .create_ab_test(even_split_test("t1", "m1", "m2"))
            .await
            .unwrap();
        let router = Router::new(store);

        let available = vec!["m1".to_string(), "m2".to_string()];
        let selected = router.select_model(&context("u1"), &available).await.unwrap();
        // Whatever variant u1 lands on, repeat selections must agree.
        for _ in 0..10 {
            let again = router.select_model(&context("u1"), &available).await.unwrap();
            assert_eq!(again, selected);
        }
    }

    #[tokio::test]
    async fn rules_beat_priority_selection() {
        let store = store_with_models(vec![
            model("cheap", ModelPriority::Highest),
            model("coder", ModelPriority::Low),
        ])
        .await;
        store
            .add_routing_rule(RoutingRule {
                rule_id: "r1".into(),
                name: "coding goes to coder".into(),
                conditions: BTreeMap::from([(ConditionKey::TaskType, "coding".into())]),
                target_models: vec!["coder".into()],
                weight: 1.0,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let router = Router::new(store);

        let available = vec!["cheap".to_string(), "coder".to_string()];
        let mut ctx = context("u1");
        ctx.task_type = Some("coding".into());
        assert_eq!(router.select_model(&ctx, &available).await.unwrap(), "coder");

        // Without the matching task type, priority selection applies.
        assert_eq!(
            router.select_model(&context("u1"), &available).await.unwrap(),
            "cheap"
        );
    }

    #[tokio::test]
    async fn tier_boost_shifts_effective_priority() {
        let store = store_with_models(vec![
            model("standard", ModelPriority::High),
            model("premium-only", ModelPriority::Medium),
        ])
        .await;
        store
            .create_user_tier(UserTier {
                tier_id: "premium".into(),
                name: "Premium".into(),
                model_access: vec![],
                priority_boost: 0,
                rate_limit_multiplier: 2.0,
                api_key_overrides: BTreeMap::new(),
                features: vec![],
            })
            .await
            .unwrap();
        let router = Router::new(store);

        let available = vec!["premium-only".to_string(), "standard".to_string()];
        let mut ctx = context("u1");
        ctx.user_tier = Some("premium".into());
        // High (2) beats Medium (3) regardless of tier with zero boost.
        assert_eq!(
            router.select_model(&ctx, &available).await.unwrap(),
            "standard"
        );
    }

    #[tokio::test]
    async fn priority_ties_break_alphabetically() {
        let store = store_with_models(vec![
            model("beta", ModelPriority::Medium),
            model("alpha", ModelPriority::Medium),
        ])
        .await;
        let router = Router::new(store);
        let available = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(
            router.select_model(&context("u1"), &available).await.unwrap(),
            "alpha"
        );
    }

    #[tokio::test]
    async fn empty_available_set_is_no_healthy_model() {
        let store = store_with_models(vec![]).await;
        let router = Router::new(store);
        assert!(matches!(
            router.select_model(&context("u1"), &[]).await,
            Err(GatewayError::NoHealthyModel)
        ));
    }

    #[tokio::test]
    async fn unknown_models_fall_back_to_first_available() {
        let store = store_with_models(vec![]).await;
        let router = Router::new(store);
        let available = vec!["ghost".to_string()];
        assert_eq!(
            router.select_model(&context("u1"), &available).await.unwrap(),
            "ghost"
        );
    }
}
