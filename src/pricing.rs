use crate::dto::Usage;
use crate::settings::RelaySettings;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PricingTable {
    pub quota_per_unit: f64,
    pub pre_consumed_quota: u64,
    pub default_model_ratio: f64,
    pub model_price: HashMap<String, f64>,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
}

impl PricingTable {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            quota_per_unit: settings.quota_per_unit,
            pre_consumed_quota: settings.pre_consumed_quota,
            default_model_ratio: settings.default_model_ratio,
            model_price: settings.model_price.clone(),
            model_ratio: settings.model_ratio.clone(),
            completion_ratio: settings.completion_ratio.clone(),
            audio_ratio: settings.audio_ratio.clone(),
            group_ratio: settings.group_ratio.clone(),
        }
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        match self.model_ratio.get(model) {
            Some(ratio) => *ratio,
            None => {
                tracing::debug!(model = %model, "model ratio not configured, using default");
                self.default_model_ratio
            }
        }
    }
}

/// Pricing inputs resolved once per request; the same quote drives both the
/// reservation and the final settlement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub pre_consume: u64,
    pub model_price: Option<f64>,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub audio_ratio: f64,
    pub quota_per_unit: f64,
}

impl Quote {
    pub fn for_model(table: &PricingTable, model: &str, group: &str) -> Self {
        let group_ratio = table.group_ratio(group);
        let completion_ratio = table.completion_ratio.get(model).copied().unwrap_or(1.0);
        let audio_ratio = table.audio_ratio.get(model).copied().unwrap_or(1.0);
        match table.model_price.get(model).copied() {
            Some(price) => Self {
                pre_consume: round_quota(price * table.quota_per_unit * group_ratio),
                model_price: Some(price),
                model_ratio: 0.0,
                group_ratio,
                completion_ratio,
                audio_ratio,
                quota_per_unit: table.quota_per_unit,
            },
            None => {
                let model_ratio = table.model_ratio(model);
                Self {
                    pre_consume: round_quota(
                        table.pre_consumed_quota as f64 * model_ratio * group_ratio,
                    ),
                    model_price: None,
                    model_ratio,
                    group_ratio,
                    completion_ratio,
                    audio_ratio,
                    quota_per_unit: table.quota_per_unit,
                }
            }
        }
    }

    pub fn use_price(&self) -> bool {
        self.model_price.is_some()
    }

    pub fn settle_cost(&self, usage: &Usage) -> u64 {
        if let Some(price) = self.model_price {
            return round_quota(price * self.quota_per_unit * self.group_ratio);
        }

        let audio_in = usage.prompt_tokens_details.audio_tokens;
        let text_in = usage.prompt_tokens.saturating_sub(audio_in);
        let audio_out = usage.completion_token_details.audio_tokens;
        let text_out = usage.completion_tokens.saturating_sub(audio_out);

        let weighted_in = text_in as f64 + audio_in as f64 * self.audio_ratio;
        let weighted_out =
            (text_out as f64 + audio_out as f64 * self.audio_ratio) * self.completion_ratio;
        let ratio = self.model_ratio * self.group_ratio;
        let cost = round_quota((weighted_in + weighted_out) * ratio);

        let billed_tokens = usage.prompt_tokens + usage.completion_tokens;
        if cost == 0 && ratio > 0.0 && billed_tokens > 0 {
            1
        } else {
            cost
        }
    }
}

fn round_quota(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}
