use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub text_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default)]
    pub image_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokenDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub text_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
    #[serde(default, rename = "completion_tokens_details")]
    pub completion_token_details: CompletionTokenDetails,
}

impl Usage {
    /// Derives completion tokens from the total, for providers whose usage
    /// block leaves `completion_tokens` out or reports it unreliably.
    pub fn recompute_completion(&mut self) {
        self.completion_tokens = self.total_tokens.saturating_sub(self.prompt_tokens);
        self.completion_token_details.text_tokens = self
            .completion_tokens
            .saturating_sub(self.completion_token_details.reasoning_tokens);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoiceDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChoiceDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

/// The client-facing streaming unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsStreamResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionsStreamResponse {
    /// A chunk with exactly one choice carrying only a finish reason.
    pub fn finish(id: &str, created: i64, model: &str, finish_reason: &str) -> Self {
        Self {
            id: id.to_string(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            system_fingerprint: None,
            choices: vec![StreamChoice {
                finish_reason: Some(finish_reason.to_string()),
                ..StreamChoice::default()
            }],
            usage: None,
        }
    }

    /// The terminal usage chunk: no choices, usage populated.
    pub fn final_usage(id: &str, created: i64, model: &str, usage: Usage) -> Self {
        Self {
            id: id.to_string(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            system_fingerprint: None,
            choices: Vec::new(),
            usage: Some(usage),
        }
    }
}

/// Non-streaming chat completion envelope. Fields the relay does not touch are
/// carried through `extra_body` so re-encoding is lossless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Value>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeInputTokenDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub text_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeOutputTokenDetails {
    #[serde(default)]
    pub text_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeUsage {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub input_token_details: RealtimeInputTokenDetails,
    #[serde(default)]
    pub output_token_details: RealtimeOutputTokenDetails,
}

impl RealtimeUsage {
    pub fn accumulate(&mut self, other: &RealtimeUsage) {
        self.total_tokens += other.total_tokens;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.input_token_details.cached_tokens += other.input_token_details.cached_tokens;
        self.input_token_details.text_tokens += other.input_token_details.text_tokens;
        self.input_token_details.audio_tokens += other.input_token_details.audio_tokens;
        self.output_token_details.text_tokens += other.output_token_details.text_tokens;
        self.output_token_details.audio_tokens += other.output_token_details.audio_tokens;
    }

    pub fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: self.input_token_details.cached_tokens,
                text_tokens: self.input_token_details.text_tokens,
                audio_tokens: self.input_token_details.audio_tokens,
                image_tokens: 0,
            },
            completion_token_details: CompletionTokenDetails {
                reasoning_tokens: 0,
                text_tokens: self.output_token_details.text_tokens,
                audio_tokens: self.output_token_details.audio_tokens,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<RealtimeUsage>,
    #[serde(flatten)]
    pub extra_body: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OpenAiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RealtimeResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}
