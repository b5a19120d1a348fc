use super::{Adaptor, RelayContext, Upstream};
use crate::dto::{
    CHAT_COMPLETION_CHUNK_OBJECT, ChatCompletionsStreamResponse, OpenAiError, StreamChoice,
    TextResponse, Usage,
};
use crate::error::RelayError;
use crate::frame::{self, FrameSink};
use crate::relay_info::RelayInfo;
use crate::scanner::{self, LineHandler, ScannerConfig, StreamScanner, StreamState};
use crate::tokens::{self, TokenEstimator};
use crate::upstream;
use async_trait::async_trait;
use axum::http::{HeaderName, header};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Completion tokens charged per tool call when usage has to be estimated.
pub const TOOL_CALL_TOKEN_SURCHARGE: u64 = 7;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const STREAM_IDLE_TIMEOUT_CODE: &str = "stream_idle_timeout";

pub struct XaiAdaptor;

/// Vendor chunk as it arrives; fields outside the canonical chunk (citations
/// and the like) are dropped on decode.
#[derive(Debug, Deserialize)]
struct XaiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    system_fingerprint: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Default)]
pub struct XaiStreamHandler {
    response_text: String,
    tool_count: u64,
    usage: Option<Usage>,
    finish_forwarded: bool,
    client_gone: bool,
    last_id: Option<String>,
    last_created: Option<i64>,
    last_model: Option<String>,
}

impl XaiStreamHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn accumulate(&mut self, choices: &[StreamChoice]) {
        for choice in choices {
            if let Some(content) = &choice.delta.content {
                self.response_text.push_str(content);
            }
            if let Some(reasoning) = &choice.delta.reasoning_content {
                self.response_text.push_str(reasoning);
            }
            for call in &choice.delta.tool_calls {
                if let Some(name) = &call.function.name {
                    self.tool_count += 1;
                    self.response_text.push_str(name);
                }
                self.response_text.push_str(&call.function.arguments);
            }
            if choice.finish_reason.is_some() {
                self.finish_forwarded = true;
            }
        }
    }

    pub fn reported_usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Usage to bill: what the provider reported, or an estimate from the
    /// streamed text plus a flat surcharge per tool call.
    pub fn billable_usage(
        &self,
        estimator: &dyn TokenEstimator,
        model: &str,
        prompt_tokens: u64,
    ) -> Usage {
        if let Some(usage) = &self.usage {
            return usage.clone();
        }
        let mut usage =
            tokens::response_text_to_usage(estimator, &self.response_text, model, prompt_tokens);
        usage.completion_tokens += self.tool_count * TOOL_CALL_TOKEN_SURCHARGE;
        usage.completion_token_details.text_tokens = usage.completion_tokens;
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        usage
    }
}

#[async_trait]
impl LineHandler for XaiStreamHandler {
    async fn handle(&mut self, payload: &str, sink: &mut dyn FrameSink) -> bool {
        let chunk: XaiStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable xai stream chunk");
                return true;
            }
        };

        let usage = chunk.usage.map(|mut usage| {
            usage.recompute_completion();
            self.usage = Some(usage.clone());
            usage
        });

        self.accumulate(&chunk.choices);
        self.last_id = Some(chunk.id.clone());
        self.last_created = Some(chunk.created);
        self.last_model = Some(chunk.model.clone());

        let canonical = ChatCompletionsStreamResponse {
            id: chunk.id,
            object: if chunk.object.is_empty() {
                CHAT_COMPLETION_CHUNK_OBJECT.to_string()
            } else {
                chunk.object
            },
            created: chunk.created,
            model: chunk.model,
            system_fingerprint: chunk.system_fingerprint,
            choices: chunk.choices,
            usage,
        };

        if let Err(err) = frame::object_data(sink, &canonical).await {
            tracing::warn!(error = %err, "downstream write failed, stopping stream");
            self.client_gone = true;
            return false;
        }
        true
    }
}

/// Hop-by-hop and length headers that no longer describe the re-encoded body.
fn skip_copied_header(name: &HeaderName) -> bool {
    name == header::CONTENT_LENGTH
        || name == header::TRANSFER_ENCODING
        || name == header::CONNECTION
        || name == header::CONTENT_ENCODING
        || name.as_str() == "keep-alive"
}

impl XaiAdaptor {
    async fn stream_response(
        &self,
        ctx: &RelayContext,
        resp: reqwest::Response,
        info: &mut RelayInfo,
    ) -> Result<Usage, RelayError> {
        self.stream_body(ctx, scanner::body_reader(resp), info).await
    }

    /// Relays an SSE body and writes the stream tail: an error event after an
    /// idle timeout, a finish chunk if none was forwarded, the usage chunk and
    /// `[DONE]`.
    async fn stream_body<R>(
        &self,
        ctx: &RelayContext,
        body: R,
        info: &mut RelayInfo,
    ) -> Result<Usage, RelayError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        {
            let mut sink = ctx.downstream.lock().await;
            frame::set_event_stream_headers(&mut **sink);
        }

        let config = ScannerConfig::from_settings(&ctx.settings, &info.upstream_model_name);
        let outcome = StreamScanner::new(config)
            .run(
                body,
                ctx.downstream.clone(),
                XaiStreamHandler::new(),
                info,
            )
            .await?;
        let handler = outcome.handler;
        let usage = handler.billable_usage(
            ctx.estimator.as_ref(),
            &info.upstream_model_name,
            info.prompt_tokens,
        );

        if outcome.state == StreamState::Cancelled || handler.client_gone {
            tracing::info!(request_id = %info.request_id, "client went away mid-stream");
            return Ok(usage);
        }

        let id = handler.last_id.clone().unwrap_or_else(|| info.response_id());
        let created = handler
            .last_created
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let model = handler
            .last_model
            .clone()
            .unwrap_or_else(|| info.upstream_model_name.clone());

        let mut sink = ctx.downstream.lock().await;
        let finished: Result<(), frame::FrameError> = async {
            if outcome.state == StreamState::TimedOut {
                let error = OpenAiError {
                    message: "upstream stream idle timeout".to_string(),
                    error_type: "relay_error".to_string(),
                    param: None,
                    code: Some(STREAM_IDLE_TIMEOUT_CODE.to_string()),
                };
                let payload = serde_json::to_string(&serde_json::json!({ "error": error }))?;
                frame::event_data(&mut **sink, "error", &payload).await?;
            }
            if !handler.finish_forwarded {
                let finish = ChatCompletionsStreamResponse::finish(&id, created, &model, "stop");
                frame::object_data(&mut **sink, &finish).await?;
            }
            if handler.reported_usage().is_none() && info.include_usage {
                let final_usage =
                    ChatCompletionsStreamResponse::final_usage(&id, created, &model, usage.clone());
                frame::object_data(&mut **sink, &final_usage).await?;
            }
            frame::done(&mut **sink).await
        }
        .await;
        if let Err(err) = finished {
            tracing::warn!(error = %err, "failed to finish downstream stream");
        }
        if let Err(err) = sink.close().await {
            tracing::warn!(error = %err, "close_response_body_failed");
        }
        Ok(usage)
    }

    async fn text_response(
        &self,
        ctx: &RelayContext,
        resp: reqwest::Response,
    ) -> Result<Usage, RelayError> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|err| RelayError::ReadResponseBody(err.to_string()))?;
        let mut response: TextResponse =
            serde_json::from_slice(&body).map_err(RelayError::BadResponseBody)?;
        response.usage.recompute_completion();
        let encoded = serde_json::to_vec(&response).map_err(RelayError::BadResponseBody)?;

        let mut sink = ctx.downstream.lock().await;
        for (name, value) in headers.iter() {
            if skip_copied_header(name) {
                continue;
            }
            sink.set_header(name.clone(), value.clone());
        }
        sink.write_header(status);
        sink.write(&encoded)
            .await
            .map_err(RelayError::CopyResponseBody)?;
        sink.flush().await.map_err(RelayError::CopyResponseBody)?;
        sink.close().await.map_err(RelayError::CloseResponseBody)?;
        Ok(response.usage)
    }
}

/// Points the request at the upstream model and asks for usage on streams.
fn rewrite_request_body(body: &[u8], info: &RelayInfo) -> Result<Bytes, RelayError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|err| RelayError::DoRequestFailed(format!("invalid request body: {err}")))?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "model".to_string(),
            Value::String(info.upstream_model_name.clone()),
        );
        if info.is_stream {
            map.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        }
    }
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|err| RelayError::DoRequestFailed(err.to_string()))
}

#[async_trait]
impl Adaptor for XaiAdaptor {
    async fn do_request(
        &self,
        ctx: &RelayContext,
        info: &mut RelayInfo,
        body: Option<Bytes>,
    ) -> Result<Upstream, RelayError> {
        let body = body.unwrap_or_default();
        let body = rewrite_request_body(&body, info)?;
        let timeout = (!info.is_stream)
            .then(|| Duration::from_millis(ctx.settings.request_timeout_ms.max(1)));
        let resp =
            upstream::post_json(&ctx.http, &info.channel, CHAT_COMPLETIONS_PATH, body, timeout)
                .await?;
        Ok(Upstream::Http(resp))
    }

    async fn do_response(
        &self,
        ctx: &RelayContext,
        upstream: Upstream,
        info: &mut RelayInfo,
    ) -> Result<Usage, RelayError> {
        let Upstream::Http(resp) = upstream else {
            return Err(RelayError::DoRequestFailed(
                "xai adaptor expects an http upstream".to_string(),
            ));
        };
        if !resp.status().is_success() {
            return Err(upstream::upstream_error(resp).await);
        }
        if info.is_stream {
            self.stream_response(ctx, resp, info).await
        } else {
            self.text_response(ctx, resp).await
        }
    }
}
