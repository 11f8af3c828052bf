use std::collections::HashMap;

use serde_json::Value;

use mrelay_protocol::Usage;

/// Quota units per ratio point per token. A model_ratio of 1.0 bills one
/// quota unit per token.
const QUOTA_PER_TOKEN: f64 = 1.0;

/// Completion allowance assumed at pre-consume time when the client does not
/// cap output; reconciled against real usage at settle.
pub const DEFAULT_MAX_COMPLETION: u32 = 1024;

#[derive(Debug, Clone, Copy)]
pub struct Ratios {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
    /// Flat per-request price added on top of the token-based amount.
    pub fixed_price: Option<f64>,
}

/// Model and group price table with config-supplied overrides.
#[derive(Debug, Clone)]
pub struct PriceTable {
    model_ratios: HashMap<String, f64>,
    completion_ratios: HashMap<String, f64>,
    group_ratios: HashMap<String, f64>,
    fixed_prices: HashMap<String, f64>,
    default_model_ratio: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut model_ratios = HashMap::new();
        for (model, ratio) in [
            ("gpt-4o", 1.25),
            ("gpt-4o-mini", 0.075),
            ("gpt-4.1", 1.0),
            ("gpt-3.5-turbo", 0.25),
            ("o3", 1.0),
            ("claude-3-5-sonnet", 1.5),
            ("claude-3-5-haiku", 0.4),
            ("claude-3-opus", 7.5),
            ("gemini-2.0-flash", 0.05),
            ("gemini-1.5-pro", 0.625),
            ("deepseek-chat", 0.135),
            ("qwen-max", 1.2),
            ("glm-4", 0.5),
            ("ERNIE-4.0-8K", 0.6),
            ("command-r-plus", 1.5),
            ("text-embedding-3-small", 0.01),
        ] {
            model_ratios.insert(model.to_string(), ratio);
        }

        let mut completion_ratios = HashMap::new();
        for (prefix, ratio) in [
            ("gpt-4o", 4.0),
            ("gpt-4.1", 4.0),
            ("gpt-3.5", 3.0),
            ("o3", 4.0),
            ("claude", 5.0),
            ("gemini", 4.0),
            ("deepseek", 4.0),
        ] {
            completion_ratios.insert(prefix.to_string(), ratio);
        }

        let mut fixed_prices = HashMap::new();
        for (action, price) in [
            ("mj_imagine", 50.0),
            ("mj_change", 50.0),
            ("mj_blend", 50.0),
            ("mj_describe", 25.0),
            ("mj_upscale", 25.0),
            ("suno_music", 100.0),
            ("suno_lyrics", 10.0),
        ] {
            fixed_prices.insert(action.to_string(), price);
        }

        Self {
            model_ratios,
            completion_ratios,
            group_ratios: HashMap::new(),
            fixed_prices,
            default_model_ratio: 2.5,
        }
    }
}

impl PriceTable {
    /// Merge overrides from the global config's `model_ratio_overrides`
    /// JSON: `{"model_ratio": {..}, "group_ratio": {..}, "fixed_price": {..}}`.
    pub fn with_overrides(overrides: Option<&Value>) -> Self {
        let mut table = Self::default();
        let Some(overrides) = overrides else {
            return table;
        };
        if let Some(models) = overrides.get("model_ratio").and_then(Value::as_object) {
            for (model, ratio) in models {
                if let Some(ratio) = ratio.as_f64() {
                    table.model_ratios.insert(model.clone(), ratio);
                }
            }
        }
        if let Some(groups) = overrides.get("group_ratio").and_then(Value::as_object) {
            for (group, ratio) in groups {
                if let Some(ratio) = ratio.as_f64() {
                    table.group_ratios.insert(group.clone(), ratio);
                }
            }
        }
        if let Some(fixed) = overrides.get("fixed_price").and_then(Value::as_object) {
            for (name, price) in fixed {
                if let Some(price) = price.as_f64() {
                    table.fixed_prices.insert(name.clone(), price);
                }
            }
        }
        table
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        if let Some(ratio) = self.model_ratios.get(model) {
            return *ratio;
        }
        // Versioned names fall back to their family entry.
        self.model_ratios
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, ratio)| *ratio)
            .unwrap_or(self.default_model_ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratios
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ratio)| *ratio)
            .unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    pub fn fixed_price(&self, name: &str) -> Option<f64> {
        self.fixed_prices.get(name).copied()
    }

    pub fn ratios(&self, model: &str, group: &str) -> Ratios {
        Ratios {
            model_ratio: self.model_ratio(model),
            completion_ratio: self.completion_ratio(model),
            group_ratio: self.group_ratio(group),
            fixed_price: self.fixed_price(model),
        }
    }
}

/// Upper-bound reservation taken before upstream dispatch:
/// `(prompt x model_ratio + max_completion x model_ratio x completion_ratio)
/// x group_ratio + fixed_price`.
pub fn pre_consume_quota(prompt_tokens: u32, max_completion: Option<u32>, ratios: &Ratios) -> i64 {
    let completion = max_completion.unwrap_or(DEFAULT_MAX_COMPLETION) as f64;
    let tokens = (prompt_tokens as f64 * ratios.model_ratio
        + completion * ratios.model_ratio * ratios.completion_ratio)
        * ratios.group_ratio
        * QUOTA_PER_TOKEN;
    let amount = tokens + ratios.fixed_price.unwrap_or(0.0);
    (amount.ceil() as i64).max(1)
}

/// Real cost once usage is known:
/// `(prompt x model_ratio + completion x model_ratio x completion_ratio)
/// x group_ratio + fixed_price`.
pub fn actual_quota(usage: &Usage, ratios: &Ratios) -> i64 {
    let tokens = (usage.prompt_tokens as f64 * ratios.model_ratio
        + usage.completion_tokens as f64 * ratios.model_ratio * ratios.completion_ratio)
        * ratios.group_ratio
        * QUOTA_PER_TOKEN;
    let amount = (tokens + ratios.fixed_price.unwrap_or(0.0)).round() as i64;
    if usage.total_tokens == 0 && ratios.fixed_price.is_none() {
        0
    } else {
        amount.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_model_falls_back_to_family() {
        let table = PriceTable::default();
        assert_eq!(table.model_ratio("gpt-4o-2024-11-20"), 1.25);
        assert_eq!(table.model_ratio("gpt-4o-mini-2024-07-18"), 0.075);
        assert_eq!(table.model_ratio("entirely-unknown"), 2.5);
    }

    #[test]
    fn spec_example_settles_to_one_unit() {
        // model_ratio 0.5, group_ratio 1, usage {1, 1}: round(2 x 0.5) = 1
        let ratios = Ratios {
            model_ratio: 0.5,
            completion_ratio: 1.0,
            group_ratio: 1.0,
            fixed_price: None,
        };
        assert_eq!(actual_quota(&Usage::new(1, 1), &ratios), 1);
    }

    #[test]
    fn fixed_price_adds_to_token_billing() {
        let ratios = Ratios {
            model_ratio: 1.0,
            completion_ratio: 1.0,
            group_ratio: 1.0,
            fixed_price: Some(50.0),
        };
        // tokens 10 + 5, plus the flat 50 on top
        assert_eq!(pre_consume_quota(10, Some(5), &ratios), 65);
        assert_eq!(actual_quota(&Usage::new(10, 5), &ratios), 65);
    }

    #[test]
    fn fixed_price_alone_bills_without_tokens() {
        // Task submissions zero the token ratios; only the flat price lands.
        let ratios = Ratios {
            model_ratio: 0.0,
            completion_ratio: 0.0,
            group_ratio: 1.0,
            fixed_price: Some(50.0),
        };
        assert_eq!(pre_consume_quota(0, Some(0), &ratios), 50);
        assert_eq!(actual_quota(&Usage::default(), &ratios), 50);
    }

    #[test]
    fn pre_consume_is_an_upper_bound_for_capped_requests() {
        let ratios = Ratios {
            model_ratio: 1.0,
            completion_ratio: 2.0,
            group_ratio: 1.0,
            fixed_price: None,
        };
        let pre = pre_consume_quota(100, Some(50), &ratios);
        let actual = actual_quota(&Usage::new(100, 50), &ratios);
        assert!(pre >= actual);
        assert_eq!(pre, 200);
    }

    #[test]
    fn group_ratio_scales_everything() {
        let mut table = PriceTable::default();
        table.group_ratios.insert("vip".to_string(), 0.5);
        let ratios = table.ratios("gpt-3.5-turbo", "vip");
        assert_eq!(ratios.group_ratio, 0.5);
        assert_eq!(table.ratios("gpt-3.5-turbo", "default").group_ratio, 1.0);
    }

    #[test]
    fn zero_usage_settles_to_zero() {
        let ratios = Ratios {
            model_ratio: 1.0,
            completion_ratio: 1.0,
            group_ratio: 1.0,
            fixed_price: None,
        };
        assert_eq!(actual_quota(&Usage::default(), &ratios), 0);
    }
}
