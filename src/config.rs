use serde::{Deserialize, Serialize};

/// One upstream account the relay can route to. `model_mapping` and
/// `status_code_mapping` stay raw JSON text; they are decoded per request so a
/// malformed value fails that request instead of the whole channel table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub api_type: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: ChannelAuthConfig,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: String,
    #[serde(default)]
    pub status_code_mapping: String,
}

impl ChannelConfig {
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelAuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: ChannelAuthType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAuthType {
    #[default]
    Bearer,
    Header,
    Query,
}
