//! Dry-run call and cost estimation. Reads, never writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointState;
use crate::condition::{self, ExperimentDesign, RunMode};

fn default_tokens_per_call() -> u32 {
    300
}

/// Per-model pricing: model -> tier, tier -> USD per 1k tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    #[serde(default)]
    pub model_tiers: BTreeMap<String, String>,
    #[serde(default)]
    pub tier_costs: BTreeMap<String, f64>,
    /// Prompt plus completion tokens assumed per call.
    #[serde(default = "default_tokens_per_call")]
    pub tokens_per_call: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            model_tiers: BTreeMap::new(),
            tier_costs: BTreeMap::new(),
            tokens_per_call: default_tokens_per_call(),
        }
    }
}

impl PricingConfig {
    /// USD per 1k tokens for `model`, if priced.
    pub fn rate_for(&self, model: &str) -> Option<(&str, f64)> {
        let tier = self.model_tiers.get(model)?;
        let cost = self.tier_costs.get(tier)?;
        Some((tier.as_str(), *cost))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEstimate {
    pub model: String,
    pub tier: Option<String>,
    pub calls: u64,
    /// Calls still to make after discounting a checkpoint.
    pub remaining_calls: u64,
    /// `None` when the model has no tier or the tier no price.
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub mode: RunMode,
    pub conditions: u64,
    pub total_calls: u64,
    pub remaining_calls: u64,
    pub total_cost_usd: f64,
    pub models: Vec<ModelEstimate>,
    pub unpriced: Vec<String>,
}

/// Estimated spend for `calls` calls of `model`.
pub fn estimate_cost(calls: u64, model: &str, pricing: &PricingConfig) -> Option<f64> {
    let (_, per_1k) = pricing.rate_for(model)?;
    Some(calls as f64 * f64::from(pricing.tokens_per_call) / 1000.0 * per_1k)
}

/// Calls and cost for running `models` over `design` in `mode`, discounting
/// keys already completed in `checkpoint`.
pub fn estimate(
    design: &ExperimentDesign,
    mode: RunMode,
    models: &[String],
    pricing: &PricingConfig,
    checkpoint: Option<&CheckpointState>,
) -> Estimate {
    let conditions = match mode {
        RunMode::Full => condition::count(design),
        RunMode::Pilot => {
            condition::filter_for_mode(condition::generate(design), mode, design).count() as u64
        }
    };

    let mut per_model = Vec::with_capacity(models.len());
    let mut unpriced = Vec::new();
    let mut total_cost = 0.0;
    for model in models {
        let done = checkpoint.map_or(0, |cp| {
            condition::filter_for_mode(condition::generate(design), mode, design)
                .filter(|c| cp.is_complete(&c.full_key(model)))
                .count() as u64
        });
        let remaining = conditions.saturating_sub(done);
        let cost = estimate_cost(remaining, model, pricing);
        match cost {
            Some(c) => total_cost += c,
            None => unpriced.push(model.clone()),
        }
        per_model.push(ModelEstimate {
            model: model.clone(),
            tier: pricing.model_tiers.get(model).cloned(),
            calls: conditions,
            remaining_calls: remaining,
            cost_usd: cost,
        });
    }

    Estimate {
        mode,
        conditions,
        total_calls: condition::estimate_api_calls(conditions, models.len()),
        remaining_calls: per_model.iter().map(|m| m.remaining_calls).sum(),
        total_cost_usd: total_cost,
        models: per_model,
        unpriced,
    }
}
