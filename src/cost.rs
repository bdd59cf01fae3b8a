//! Cost estimation for LLM usage.
//!
//! Per-model pricing comes from the model configuration when the admin set
//! an input/output split; otherwise the static table below supplies USD per
//! 1K tokens, falling back to a conservative default for unknown models.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ModelConfig;

/// Default USD per 1K input tokens for unknown models.
const DEFAULT_INPUT_PER_1K: f64 = 0.001;
/// Default USD per 1K output tokens for unknown models.
const DEFAULT_OUTPUT_PER_1K: f64 = 0.002;

lazy_static! {
    /// USD per 1K tokens (input, output), keyed by wire-level model name.
    static ref MODEL_PRICING: HashMap<&'static str, (f64, f64)> = {
        let mut pricing = HashMap::new();
        pricing.insert("gpt-4", (0.03, 0.06));
        pricing.insert("gpt-4o", (0.005, 0.015));
        pricing.insert("gpt-4o-mini", (0.00015, 0.0006));
        pricing.insert("gpt-3.5-turbo", (0.001, 0.002));
        pricing.insert("claude-3-opus", (0.015, 0.075));
        pricing.insert("claude-3-sonnet", (0.003, 0.015));
        pricing.insert("claude-3-haiku", (0.00025, 0.00125));
        pricing.insert("gemini-pro", (0.0005, 0.0015));
        pricing.insert("gemini-1.5-pro", (0.00125, 0.005));
        pricing.insert("gemini-1.5-flash", (0.000075, 0.0003));
        pricing.insert("sonar", (0.001, 0.001));
        pricing.insert("sonar-pro", (0.003, 0.015));
        pricing
    };
}

/// Rough token count for free text: `ceil(word_count * 1.3)`.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    (words as f64 * 1.3).ceil() as u32
}

/// Per-request cost split, in USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub model_name: String,
}

fn table_pricing(model_name: &str) -> (f64, f64) {
    if let Some(rates) = MODEL_PRICING.get(model_name) {
        return *rates;
    }
    // Partial match covers dated variants like gpt-4o-2024-08-06.
    let lowered = model_name.to_lowercase();
    for (key, rates) in MODEL_PRICING.iter() {
        if lowered.contains(key) {
            return *rates;
        }
    }
    (DEFAULT_INPUT_PER_1K, DEFAULT_OUTPUT_PER_1K)
}

fn model_pricing(config: &ModelConfig) -> (f64, f64) {
    match (config.cost_per_1k_input, config.cost_per_1k_output) {
        (Some(input), Some(output)) => (input, output),
        _ => table_pricing(&config.model_name),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CostEstimator;

impl CostEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Pre-routing estimate used by budget admission, before a model is
    /// selected. Uses default pricing since the model is not yet known.
    pub fn estimate_request(&self, prompt: &str, max_tokens: u32) -> f64 {
        let input_tokens = estimate_tokens(prompt);
        (input_tokens as f64 / 1000.0) * DEFAULT_INPUT_PER_1K
            + (max_tokens as f64 / 1000.0) * DEFAULT_OUTPUT_PER_1K
    }

    /// Pre-call estimate for a specific model: estimated input tokens plus
    /// the caller-supplied output budget.
    pub fn estimate_for_model(&self, config: &ModelConfig, prompt: &str, max_tokens: u32) -> f64 {
        let (input_rate, output_rate) = model_pricing(config);
        let input_tokens = estimate_tokens(prompt);
        (input_tokens as f64 / 1000.0) * input_rate + (max_tokens as f64 / 1000.0) * output_rate
    }

    /// Actual cost of a completed call from observed token counts.
    pub fn completion_cost(&self, config: &ModelConfig, input_tokens: u32, output_tokens: u32) -> f64 {
        self.breakdown(config, input_tokens, output_tokens).total_cost
    }

    pub fn breakdown(
        &self,
        config: &ModelConfig,
        input_tokens: u32,
        output_tokens: u32,
    ) -> CostBreakdown {
        let (input_rate, output_rate) = model_pricing(config);
        let input_cost = (input_tokens as f64 / 1000.0) * input_rate;
        let output_cost = (output_tokens as f64 / 1000.0) * output_rate;
        CostBreakdown {
            input_tokens,
            output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            model_name: config.model_name.clone(),
        }
    }
}
