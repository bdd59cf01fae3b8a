//! Switchboard admin CLI.
//!
//! Operates on the gateway's JSON configuration document: model, routing,
//! A/B test and budget management plus config export. Status and usage
//! reports construct a gateway from the same document and the environment's
//! secret store.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use switchboard::{
    AbTest, AdapterRegistry, BudgetConfig, ConditionKey, ConfigStore, Gateway, GatewayOptions,
    ModelConfig, ModelPriority, ModelUpdate, ProviderKind, ResetPeriod, RoutingRule,
    SecretProvider, SecretReference, SecretStoreService,
};

#[derive(Parser)]
#[command(name = "switchboard-admin")]
#[command(about = "Switchboard admin CLI - manage gateway configuration and inspect usage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the gateway configuration document
    #[arg(long, env = "SWITCHBOARD_CONFIG", default_value = "switchboard.json")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured models
    ListModels,

    /// Add a model configuration
    AddModel {
        /// Unique model id
        model_id: String,

        /// Provider kind (openai, anthropic, gemini, perplexity, fallback)
        #[arg(long)]
        provider: String,

        /// Wire-level model name sent to the provider
        #[arg(long)]
        model_name: String,

        /// Secret store kind holding the API key (azure, gcp, vault, env)
        #[arg(long, default_value = "env")]
        secret_provider: String,

        /// Secret identifier (e.g. an environment variable name)
        #[arg(long)]
        secret_id: String,

        /// Selection priority 1 (highest) to 5 (fallback)
        #[arg(long, default_value_t = 3)]
        priority: u8,

        /// Maximum output tokens
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Default sampling temperature
        #[arg(long)]
        temperature: Option<f32>,

        /// USD per 1K input tokens
        #[arg(long)]
        cost_per_1k_input: Option<f64>,

        /// USD per 1K output tokens
        #[arg(long)]
        cost_per_1k_output: Option<f64>,

        /// Base URL override for the provider endpoint
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Update fields of an existing model
    UpdateModel {
        model_id: String,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        cost_per_1k_input: Option<f64>,

        #[arg(long)]
        cost_per_1k_output: Option<f64>,

        #[arg(long)]
        rate_limit_rpm: Option<u32>,

        #[arg(long)]
        base_url: Option<String>,
    },

    /// Enable or disable a model
    ToggleModel {
        model_id: String,

        /// true to activate, false to deactivate
        #[arg(long)]
        active: bool,
    },

    /// Add a routing rule
    AddRoutingRule {
        rule_id: String,

        #[arg(long)]
        name: String,

        /// Condition as key=value (repeatable); keys: task_type, user_tier,
        /// user_id, priority
        #[arg(long = "condition")]
        conditions: Vec<String>,

        /// Target model id in priority order (repeatable)
        #[arg(long = "target")]
        targets: Vec<String>,

        #[arg(long, default_value_t = 1.0)]
        weight: f64,
    },

    /// Create an A/B test over model variants
    CreateAbTest {
        test_id: String,

        #[arg(long)]
        name: String,

        /// Variant as name=model1,model2 (repeatable)
        #[arg(long = "variant")]
        variants: Vec<String>,

        /// Traffic split as name=fraction (repeatable, must sum to 1.0)
        #[arg(long = "split")]
        splits: Vec<String>,

        /// Test duration in days from now
        #[arg(long, default_value_t = 14)]
        days: i64,
    },

    /// Create a budget
    CreateBudget {
        budget_id: String,

        #[arg(long)]
        name: String,

        /// Budget limit in USD
        #[arg(long)]
        limit: f64,

        /// Reset period: daily, weekly, monthly, quarterly
        #[arg(long, default_value = "monthly")]
        period: String,

        /// Alert threshold as a fraction of the limit (repeatable)
        #[arg(long = "threshold")]
        thresholds: Vec<f64>,

        /// User group this budget applies to (repeatable; empty = global)
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Keep admitting requests after the limit is reached
        #[arg(long)]
        no_auto_disable: bool,
    },

    /// Print the full configuration document as JSON
    ExportConfig,

    /// Usage report over a recent window
    UsageReport {
        /// Window length in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,

        /// Restrict to one user
        #[arg(long)]
        user: Option<String>,
    },

    /// System status: providers, circuits, cache and budget
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let store = Arc::new(ConfigStore::with_document_path(&cli.config));
    store
        .load_configurations()
        .await
        .context("failed to load configuration document")?;

    match cli.command {
        Commands::ListModels => {
            let models = store.all_models().await;
            if models.is_empty() {
                println!("no models configured");
            }
            for model in models {
                println!(
                    "{:<20} {:<12} {:<24} priority={} active={}",
                    model.model_id,
                    model.provider.to_string(),
                    model.model_name,
                    model.priority.value(),
                    model.is_active,
                );
            }
        }

        Commands::AddModel {
            model_id,
            provider,
            model_name,
            secret_provider,
            secret_id,
            priority,
            max_tokens,
            temperature,
            cost_per_1k_input,
            cost_per_1k_output,
            base_url,
        } => {
            let provider = ProviderKind::from_str(&provider)?;
            let secret_provider = SecretProvider::from_str(&secret_provider)?;
            let mut config = ModelConfig::new(
                &model_id,
                provider,
                model_name,
                SecretReference {
                    provider: secret_provider,
                    secret_identifier: secret_id,
                    version: None,
                },
            );
            config.priority = ModelPriority::try_from(priority)
                .map_err(|e| anyhow::anyhow!("invalid priority: {e}"))?;
            if let Some(v) = max_tokens {
                config.max_tokens = v;
            }
            if let Some(v) = temperature {
                config.temperature = v;
            }
            config.cost_per_1k_input = cost_per_1k_input;
            config.cost_per_1k_output = cost_per_1k_output;
            config.base_url = base_url;

            store.add_model(config).await?;
            info!(model_id = %model_id, "model added");
        }

        Commands::UpdateModel {
            model_id,
            priority,
            max_tokens,
            temperature,
            cost_per_1k_input,
            cost_per_1k_output,
            rate_limit_rpm,
            base_url,
        } => {
            let priority = match priority {
                Some(value) => Some(
                    ModelPriority::try_from(value)
                        .map_err(|e| anyhow::anyhow!("invalid priority: {e}"))?,
                ),
                None => None,
            };
            let updated = store
                .update_model(
                    &model_id,
                    ModelUpdate {
                        priority,
                        max_tokens,
                        temperature,
                        cost_per_1k_input,
                        cost_per_1k_output,
                        rate_limit_rpm,
                        base_url,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }

        Commands::ToggleModel { model_id, active } => {
            store.toggle_model(&model_id, active).await?;
            info!(model_id = %model_id, active, "model toggled");
        }

        Commands::AddRoutingRule {
            rule_id,
            name,
            conditions,
            targets,
            weight,
        } => {
            if targets.is_empty() {
                bail!("at least one --target is required");
            }
            let mut parsed = BTreeMap::new();
            for condition in &conditions {
                let (key, value) = condition
                    .split_once('=')
                    .context("conditions must be key=value")?;
                parsed.insert(ConditionKey::from_str(key)?, value.to_string());
            }
            store
                .add_routing_rule(RoutingRule {
                    rule_id: rule_id.clone(),
                    name,
                    conditions: parsed,
                    target_models: targets,
                    weight,
                    is_active: true,
                    created_at: Utc::now(),
                })
                .await?;
            info!(rule_id = %rule_id, "routing rule added");
        }

        Commands::CreateAbTest {
            test_id,
            name,
            variants,
            splits,
            days,
        } => {
            let mut model_variants = BTreeMap::new();
            for variant in &variants {
                let (variant_name, models) = variant
                    .split_once('=')
                    .context("variants must be name=model1,model2")?;
                model_variants.insert(
                    variant_name.to_string(),
                    models.split(',').map(|m| m.trim().to_string()).collect(),
                );
            }
            let mut traffic_split = BTreeMap::new();
            for split in &splits {
                let (variant_name, fraction) = split
                    .split_once('=')
                    .context("splits must be name=fraction")?;
                traffic_split.insert(
                    variant_name.to_string(),
                    fraction.parse::<f64>().context("invalid split fraction")?,
                );
            }
            store
                .create_ab_test(AbTest {
                    test_id: test_id.clone(),
                    name,
                    description: String::new(),
                    is_active: true,
                    start_date: Utc::now(),
                    end_date: Utc::now() + Duration::days(days),
                    traffic_split,
                    model_variants,
                    success_metrics: vec![],
                    metadata: Default::default(),
                })
                .await?;
            info!(test_id = %test_id, "A/B test created");
        }

        Commands::CreateBudget {
            budget_id,
            name,
            limit,
            period,
            thresholds,
            groups,
            no_auto_disable,
        } => {
            store
                .create_budget(BudgetConfig {
                    budget_id: budget_id.clone(),
                    name,
                    total_budget: limit,
                    reset_period: ResetPeriod::from_str(&period)?,
                    alert_thresholds: thresholds,
                    auto_disable_at_limit: !no_auto_disable,
                    user_groups: groups,
                    created_at: Utc::now(),
                })
                .await?;
            info!(budget_id = %budget_id, "budget created");
        }

        Commands::ExportConfig => {
            let document = store.export().await;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }

        Commands::UsageReport { hours, user } => {
            let gateway = boot_gateway(store).await?;
            let report = gateway
                .usage_report(
                    Utc::now() - Duration::hours(hours),
                    Utc::now(),
                    user.as_deref(),
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            gateway.shutdown().await;
        }

        Commands::Status => {
            let gateway = boot_gateway(store).await?;
            let status = gateway.provider_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            gateway.shutdown().await;
        }
    }

    Ok(())
}

async fn boot_gateway(store: Arc<ConfigStore>) -> Result<Arc<Gateway>> {
    let secrets = Arc::new(SecretStoreService::from_env());
    let gateway = Gateway::new(
        store,
        secrets,
        AdapterRegistry::with_default_providers(),
        GatewayOptions::from_env(),
    );
    gateway.initialize().await?;
    Ok(gateway)
}
