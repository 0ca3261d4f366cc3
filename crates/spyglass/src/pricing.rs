//! Static per-model price table.
//!
//! Prices are USD per million tokens. Models match by name prefix; the
//! longest matching prefix wins so `gpt-4o-mini` is not priced as `gpt-4o`.

use spyglass_tracing::{Usage, UsageSource};

/// Price of one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = (input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output = (output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        input + output
    }
}

const PRICES: &[(&str, ModelPricing)] = &[
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4o", ModelPricing::new(2.50, 10.00)),
    ("gpt-4.1-nano", ModelPricing::new(0.10, 0.40)),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60)),
    ("gpt-4.1", ModelPricing::new(2.00, 8.00)),
    ("gpt-4-turbo", ModelPricing::new(10.00, 30.00)),
    ("gpt-4", ModelPricing::new(30.00, 60.00)),
    ("gpt-3.5-turbo", ModelPricing::new(0.50, 1.50)),
    ("o1-mini", ModelPricing::new(1.10, 4.40)),
    ("o1", ModelPricing::new(15.00, 60.00)),
    ("o3-mini", ModelPricing::new(1.10, 4.40)),
    ("o3", ModelPricing::new(2.00, 8.00)),
    ("claude-3-opus", ModelPricing::new(15.00, 75.00)),
    ("claude-3-sonnet", ModelPricing::new(3.00, 15.00)),
    ("claude-3-haiku", ModelPricing::new(0.25, 1.25)),
    ("claude-3-5-sonnet", ModelPricing::new(3.00, 15.00)),
    ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00)),
    ("claude-3-7-sonnet", ModelPricing::new(3.00, 15.00)),
    ("claude-sonnet-4", ModelPricing::new(3.00, 15.00)),
    ("claude-opus-4", ModelPricing::new(15.00, 75.00)),
    ("gemini-1.5-flash", ModelPricing::new(0.075, 0.30)),
    ("gemini-1.5-pro", ModelPricing::new(1.25, 5.00)),
    ("gemini-2.0-flash", ModelPricing::new(0.10, 0.40)),
    ("gemini-2.5-flash", ModelPricing::new(0.30, 2.50)),
    ("gemini-2.5-pro", ModelPricing::new(1.25, 10.00)),
    ("mistral-large", ModelPricing::new(2.00, 6.00)),
    ("mistral-small", ModelPricing::new(0.20, 0.60)),
    ("command-r-plus", ModelPricing::new(2.50, 10.00)),
    ("command-r", ModelPricing::new(0.15, 0.60)),
];

/// Look up pricing for a model name.
///
/// Provider prefixes such as `openai/` or `models/` are ignored.
pub fn lookup(model: &str) -> Option<ModelPricing> {
    let name = model.trim().to_lowercase();
    let name = name.rsplit('/').next().unwrap_or(&name);

    PRICES
        .iter()
        .filter(|(prefix, _)| name.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, pricing)| *pricing)
}

/// Fill in cost for a call.
///
/// A provider-reported cost is kept and tagged as reported. Otherwise cost
/// comes from the table and is tagged as estimated; unknown models stay
/// without cost.
pub fn apply_cost(usage: &mut Usage, model: Option<&str>) {
    if usage.cost.is_some() {
        usage.cost_source = Some(UsageSource::Reported);
        return;
    }

    if let Some(pricing) = model.and_then(lookup) {
        usage.cost = Some(pricing.cost(usage.input_tokens, usage.output_tokens));
        usage.cost_source = Some(UsageSource::Estimated);
    }
}
