use super::{Adaptor, RelayContext, Upstream};
use crate::config::{ChannelAuthType, ChannelConfig};
use crate::dto::{RealtimeEvent, RealtimeUsage, Usage};
use crate::error::RelayError;
use crate::frame;
use crate::relay_info::RelayInfo;
use crate::tokens::{self, TokenEstimator};
use crate::upstream::join_url;
use async_trait::async_trait;
use axum::extract::ws::Message as ClientMessage;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const REALTIME_PATH: &str = "/v1/realtime";
const RESPONSE_DONE: &str = "response.done";
const OUTPUT_DELTA_EVENTS: [&str; 2] = [
    "response.text.delta",
    "response.audio_transcript.delta",
];

pub struct RealtimeAdaptor;

/// Builds the upstream WebSocket URL for a channel and model.
fn realtime_url(channel: &ChannelConfig, model: &str) -> String {
    let base = channel.base_url.trim();
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    let mut url = format!(
        "{}?model={}",
        join_url(&base, REALTIME_PATH),
        utf8_percent_encode(model, NON_ALPHANUMERIC)
    );
    if channel.auth.auth_type == ChannelAuthType::Query {
        let name = channel.auth.query_name.as_deref().unwrap_or("api_key");
        url.push_str(&format!(
            "&{}={}",
            utf8_percent_encode(name, NON_ALPHANUMERIC),
            utf8_percent_encode(&channel.auth.value, NON_ALPHANUMERIC)
        ));
    }
    url
}

fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|err| RelayError::DoRequestFailed(format!("invalid header value: {err}")))
}

/// Usage bookkeeping for one realtime session.
#[derive(Debug, Default)]
pub struct RealtimeAccounting {
    reported: RealtimeUsage,
    saw_usage: bool,
    input_text: String,
    output_text: String,
}

impl RealtimeAccounting {
    pub fn observe_upstream(&mut self, text: &str) {
        let Ok(event) = serde_json::from_str::<RealtimeEvent>(text) else {
            tracing::debug!("skipping undecodable realtime event");
            return;
        };
        if event.event_type == RESPONSE_DONE {
            if let Some(usage) = event.response.and_then(|r| r.usage) {
                self.reported.accumulate(&usage);
                self.saw_usage = true;
            }
        } else if OUTPUT_DELTA_EVENTS.contains(&event.event_type.as_str()) {
            if let Some(delta) = event.delta {
                self.output_text.push_str(&delta);
            }
        }
    }

    pub fn observe_client(&mut self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let Some(parts) = value
            .get("item")
            .and_then(|item| item.get("content"))
            .and_then(Value::as_array)
        else {
            return;
        };
        for part in parts {
            for key in ["text", "transcript"] {
                if let Some(text) = part.get(key).and_then(Value::as_str) {
                    self.input_text.push_str(text);
                }
            }
        }
    }

    pub fn into_usage(
        self,
        estimator: &dyn TokenEstimator,
        model: &str,
        prompt_tokens: u64,
    ) -> Usage {
        if self.saw_usage {
            return self.reported.to_usage();
        }
        let prompt_tokens = prompt_tokens + estimator.count(&self.input_text, model);
        tokens::response_text_to_usage(estimator, &self.output_text, model, prompt_tokens)
    }
}

#[async_trait]
impl Adaptor for RealtimeAdaptor {
    async fn do_request(
        &self,
        _ctx: &RelayContext,
        info: &mut RelayInfo,
        _body: Option<Bytes>,
    ) -> Result<Upstream, RelayError> {
        let url = realtime_url(&info.channel, &info.upstream_model_name);
        let mut request = url
            .into_client_request()
            .map_err(|err| RelayError::DoRequestFailed(err.to_string()))?;
        let headers = request.headers_mut();
        match info.channel.auth.auth_type {
            ChannelAuthType::Bearer => {
                headers.insert(
                    "authorization",
                    header_value(&format!("Bearer {}", info.channel.auth.value))?,
                );
            }
            ChannelAuthType::Header => {
                let name = info
                    .channel
                    .auth
                    .header_name
                    .clone()
                    .unwrap_or_else(|| "x-api-key".to_string());
                let name = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(
                    name.as_bytes(),
                )
                .map_err(|err| RelayError::DoRequestFailed(err.to_string()))?;
                headers.insert(name, header_value(&info.channel.auth.value)?);
            }
            ChannelAuthType::Query => {}
        }
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| RelayError::DoRequestFailed(err.to_string()))?;
        tracing::debug!(request_id = %info.request_id, "upstream realtime socket open");
        Ok(Upstream::WebSocket(Box::new(socket)))
    }

    async fn do_response(
        &self,
        ctx: &RelayContext,
        upstream: Upstream,
        info: &mut RelayInfo,
    ) -> Result<Usage, RelayError> {
        let Upstream::WebSocket(socket) = upstream else {
            return Err(RelayError::DoRequestFailed(
                "realtime adaptor expects a websocket upstream".to_string(),
            ));
        };
        let mut client_rx = info.client_ws.take().ok_or_else(|| {
            RelayError::DoRequestFailed("realtime relay requires a client websocket".to_string())
        })?;
        let (mut upstream_tx, mut upstream_rx) = (*socket).split();
        let mut accounting = RealtimeAccounting::default();

        loop {
            tokio::select! {
                msg = client_rx.next() => match msg {
                    Some(Ok(ClientMessage::Text(text))) => {
                        accounting.observe_client(text.as_str());
                        let forwarded = UpstreamMessage::Text(text.as_str().to_string().into());
                        if let Err(err) = upstream_tx.send(forwarded).await {
                            tracing::warn!(error = %err, "realtime forward to upstream failed");
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Binary(data))) => {
                        if let Err(err) = upstream_tx.send(UpstreamMessage::Binary(data)).await {
                            tracing::warn!(error = %err, "realtime forward to upstream failed");
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => {
                        tracing::debug!(
                            request_id = %info.request_id,
                            "client closed realtime session"
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "realtime client read failed");
                        break;
                    }
                },
                msg = upstream_rx.next() => match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        info.set_first_response_time();
                        accounting.observe_upstream(text.as_str());
                        let mut sink = ctx.downstream.lock().await;
                        if let Err(err) = frame::wss_string(&mut **sink, text.as_str()).await {
                            tracing::warn!(error = %err, "realtime forward to client failed");
                            break;
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(_))) | None => {
                        tracing::debug!(
                            request_id = %info.request_id,
                            "upstream closed realtime session"
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "realtime upstream read failed");
                        break;
                    }
                },
            }
        }

        if let Err(err) = upstream_tx.close().await {
            tracing::debug!(error = %err, "upstream realtime close failed");
        }
        if let Err(err) = ctx.downstream.lock().await.close().await {
            tracing::debug!(error = %err, "client realtime close failed");
        }

        Ok(accounting.into_usage(
            ctx.estimator.as_ref(),
            &info.upstream_model_name,
            info.prompt_tokens,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelAuthConfig;
    use crate::tokens::testing::WordEstimator;

    fn channel(base_url: &str, auth: ChannelAuthConfig) -> ChannelConfig {
        ChannelConfig {
            id: "rt".to_string(),
            api_type: "openai_realtime".to_string(),
            base_url: base_url.to_string(),
            auth,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn url_switches_scheme_and_encodes_model() {
        let url = realtime_url(
            &channel("https://api.openai.com/v1", ChannelAuthConfig::default()),
            "gpt-4o-realtime-preview",
        );
        assert_eq!(
            url,
            "wss://api.openai.com/v1/realtime?model=gpt%2D4o%2Drealtime%2Dpreview"
        );

        let auth = ChannelAuthConfig {
            auth_type: ChannelAuthType::Query,
            value: "k 1".to_string(),
            ..ChannelAuthConfig::default()
        };
        let url = realtime_url(&channel("http://127.0.0.1:9000", auth), "m");
        assert_eq!(url, "ws://127.0.0.1:9000/v1/realtime?model=m&api%5Fkey=k%201");
    }

    #[test]
    fn response_done_usage_is_summed() {
        let mut accounting = RealtimeAccounting::default();
        for _ in 0..2 {
            accounting.observe_upstream(
                r#"{"type":"response.done","event_id":"e","response":{"usage":{"total_tokens":15,"input_tokens":10,"output_tokens":5,"input_token_details":{"text_tokens":8,"audio_tokens":2},"output_token_details":{"text_tokens":5}}}}"#,
            );
        }
        accounting.observe_upstream(
            r#"{"type":"response.text.delta","event_id":"e","delta":"ignored when usage is reported"}"#,
        );
        let usage = accounting.into_usage(&WordEstimator, "m", 0);
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 10);
        assert_eq!(usage.total_tokens, 30);
        assert_eq!(usage.prompt_tokens_details.audio_tokens, 4);
    }

    #[test]
    fn deltas_are_estimated_without_reported_usage() {
        let mut accounting = RealtimeAccounting::default();
        accounting.observe_client(
            r#"{"type":"conversation.item.create","item":{"type":"message","role":"user","content":[{"type":"input_text","text":"what time is it"}]}}"#,
        );
        accounting.observe_upstream(
            r#"{"type":"response.text.delta","event_id":"e","delta":"it is "}"#,
        );
        accounting.observe_upstream(
            r#"{"type":"response.audio_transcript.delta","event_id":"e","delta":"noon"}"#,
        );
        accounting.observe_upstream("not json");
        let usage = accounting.into_usage(&WordEstimator, "m", 1);
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 3);
    }
}
