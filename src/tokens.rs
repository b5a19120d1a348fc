use crate::dto::Usage;
use serde_json::Value;

const TOKENS_PER_MESSAGE: u64 = 4;
const TOKENS_PER_NAME: u64 = 1;
const REPLY_PRIMER_TOKENS: u64 = 3;

pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str, model: &str) -> u64;
}

#[derive(Debug, thiserror::Error)]
#[error("token estimator init failed: {0}")]
pub struct EstimatorInitError(String);

/// BPE counter; `o200k_base` for the 4o/o-series families, `cl100k_base`
/// for everything else.
pub struct TiktokenEstimator {
    cl100k: tiktoken_rs::CoreBPE,
    o200k: tiktoken_rs::CoreBPE,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self, EstimatorInitError> {
        let cl100k =
            tiktoken_rs::cl100k_base().map_err(|e| EstimatorInitError(e.to_string()))?;
        let o200k = tiktoken_rs::o200k_base().map_err(|e| EstimatorInitError(e.to_string()))?;
        Ok(Self { cl100k, o200k })
    }

    fn select_bpe(&self, model: &str) -> &tiktoken_rs::CoreBPE {
        if model.contains("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") {
            &self.o200k
        } else {
            &self.cl100k
        }
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn count(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.select_bpe(model).encode_with_special_tokens(text).len() as u64
    }
}

/// Builds usage for a response whose provider reported none: completion is
/// estimated from the generated text, prompt comes from the request side.
pub fn response_text_to_usage(
    estimator: &dyn TokenEstimator,
    text: &str,
    model: &str,
    prompt_tokens: u64,
) -> Usage {
    let completion_tokens = estimator.count(text, model);
    let mut usage = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        ..Usage::default()
    };
    usage.prompt_tokens_details.text_tokens = prompt_tokens;
    usage.completion_token_details.text_tokens = completion_tokens;
    usage
}

/// Prompt-side estimate for a chat request body, including per-message
/// framing overhead.
pub fn estimate_chat_prompt(estimator: &dyn TokenEstimator, body: &Value, model: &str) -> u64 {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return 0;
    };
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        if let Some(role) = message.get("role").and_then(Value::as_str) {
            total += estimator.count(role, model);
        }
        if message.get("name").is_some() {
            total += TOKENS_PER_NAME;
        }
        match message.get("content") {
            Some(Value::String(text)) => total += estimator.count(text, model),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        total += estimator.count(text, model);
                    }
                }
            }
            _ => {}
        }
    }
    total + REPLY_PRIMER_TOKENS
}

#[cfg(test)]
pub(crate) mod testing {
    use super::TokenEstimator;

    /// One token per whitespace-separated word.
    pub struct WordEstimator;

    impl TokenEstimator for WordEstimator {
        fn count(&self, text: &str, _model: &str) -> u64 {
            text.split_whitespace().count() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::WordEstimator;
    use super::*;
    use serde_json::json;

    #[test]
    fn response_text_usage_adds_prompt_and_completion() {
        let usage = response_text_to_usage(&WordEstimator, "one two three", "grok-3", 5);
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 8);
        assert_eq!(usage.completion_token_details.text_tokens, 3);
    }

    #[test]
    fn chat_prompt_counts_framing_and_parts() {
        let body = json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "name": "u", "content": [
                    { "type": "text", "text": "hello there" },
                    { "type": "image_url", "image_url": { "url": "x" } }
                ]}
            ]
        });
        // 2 messages * 4 + roles 2 + name 1 + "be brief" 2 + "hello there" 2 + primer 3
        assert_eq!(estimate_chat_prompt(&WordEstimator, &body, "grok-3"), 18);
    }

    #[test]
    fn tiktoken_counts_nonempty_text() {
        let estimator = TiktokenEstimator::new().unwrap();
        assert_eq!(estimator.count("", "grok-3"), 0);
        assert!(estimator.count("hello world", "grok-3") >= 2);
        assert!(estimator.count("hello world", "gpt-4o-mini") >= 2);
    }
}
