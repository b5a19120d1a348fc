use crate::app::AppState;
use crate::config::ChannelConfig;
use crate::error::{AppError, AppResult};
use crate::frame::{self, FrameWriter, HttpDownstream, WsDownstream};
use crate::quota::QuotaUser;
use crate::relay;
use crate::relay_info::RelayInfo;
use crate::tokens;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

/// Capacity of the body channel between the relay task and the response.
const DOWNSTREAM_BUFFER: usize = 32;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let user = auth_tenant(&headers, &state).await?;
    let request: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_json", err.to_string()))?;
    let model = request
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "model_required", "model is required")
                .with_param("model")
        })?
        .to_string();
    let channel = resolve_channel(&state, &model).await?;

    let mut info = RelayInfo::new(request_id(&headers), model).with_channel(channel);
    info.user_id = user.id;
    info.group = user.group;
    info.is_stream = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    info.include_usage = request
        .get("stream_options")
        .and_then(|v| v.get("include_usage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    info.prompt_tokens =
        tokens::estimate_chat_prompt(state.estimator.as_ref(), &request, &info.origin_model_name);
    tracing::debug!(
        request_id = %info.request_id,
        model = %info.origin_model_name,
        channel = %info.channel.id,
        stream = info.is_stream,
        "relaying chat completion"
    );

    let (downstream, pending) = HttpDownstream::channel(DOWNSTREAM_BUFFER);
    let writer = FrameWriter::new(downstream);
    let task = tokio::spawn(relay_http(state, info, writer, body));
    Ok(pending.into_response(task).await)
}

/// Runs the relay for an HTTP client. Errors raised before anything was
/// committed become the response; later ones can only go out in-band.
async fn relay_http(
    state: AppState,
    mut info: RelayInfo,
    writer: FrameWriter,
    body: Bytes,
) -> AppResult<()> {
    let err = match relay::relay(&state, &mut info, writer.clone(), Some(body)).await {
        Ok(_) => return Ok(()),
        Err(err) => AppError::from(err),
    };
    let mut sink = writer.lock().await;
    if !sink.committed() {
        return Err(err);
    }
    tracing::warn!(
        request_id = %info.request_id,
        code = %err.code,
        "relay failed after response was committed"
    );
    if info.is_stream {
        let payload = json!({ "error": err.to_openai_error() });
        if let Err(write_err) = frame::event_data(&mut **sink, "error", &payload.to_string()).await
        {
            tracing::debug!(error = %write_err, "error frame not delivered");
        } else if let Err(write_err) = frame::done(&mut **sink).await {
            tracing::debug!(error = %write_err, "done frame not delivered");
        }
    }
    if let Err(close_err) = sink.close().await {
        tracing::debug!(error = %close_err, "downstream close failed");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    pub model: String,
}

pub async fn realtime(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RealtimeQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user = auth_tenant(&headers, &state).await?;
    let channel = resolve_channel(&state, &query.model).await?;
    let mut info = RelayInfo::new(request_id(&headers), query.model).with_channel(channel);
    info.user_id = user.id;
    info.group = user.group;
    info.is_stream = true;
    Ok(ws.on_upgrade(move |socket| relay_realtime(state, info, socket)))
}

async fn relay_realtime(state: AppState, mut info: RelayInfo, socket: WebSocket) {
    let (sink, stream) = socket.split();
    info.client_ws = Some(stream);
    let writer = FrameWriter::new(WsDownstream::new(sink));
    let Err(err) = relay::relay(&state, &mut info, writer.clone(), None).await else {
        return;
    };
    let err = AppError::from(err);
    tracing::warn!(
        request_id = %info.request_id,
        code = %err.code,
        "realtime relay failed"
    );
    let mut sink = writer.lock().await;
    if let Err(write_err) =
        frame::wss_error(&mut **sink, &info.realtime_event_id(), err.to_openai_error()).await
    {
        tracing::debug!(error = %write_err, "realtime error frame not delivered");
    }
    if let Err(close_err) = sink.close().await {
        tracing::debug!(error = %close_err, "realtime close failed");
    }
}

async fn auth_tenant(headers: &HeaderMap, state: &AppState) -> AppResult<QuotaUser> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing auth"))?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid auth"))?;

    state
        .quota_store
        .find_user_by_token(token)
        .await
        .map_err(|err| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "quota_store_error", err))?
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token"))
}

async fn resolve_channel(state: &AppState, model: &str) -> AppResult<ChannelConfig> {
    state
        .channel_store
        .find_channel_for_model(model)
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "channel_store_error",
                err,
            )
        })?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_available_channel",
                format!("no available channel for model {model}"),
            )
        })
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
