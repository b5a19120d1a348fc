use crate::config::{ChannelAuthConfig, ChannelAuthType, ChannelConfig};
use crate::error::RelayError;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;

/// POSTs a JSON body to the channel. Non-success statuses come back as `Ok`;
/// the adaptor decides how to surface them.
pub async fn post_json(
    client: &reqwest::Client,
    channel: &ChannelConfig,
    path: &str,
    body: Bytes,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, RelayError> {
    let url = join_url(&channel.base_url, path);
    let mut req = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(timeout) = timeout {
        req = req.timeout(timeout);
    }
    req = apply_auth(req, &channel.auth);
    req.send()
        .await
        .map_err(|err| RelayError::DoRequestFailed(err.to_string()))
}

/// Drains a failed upstream response into a structured error.
pub async fn upstream_error(resp: reqwest::Response) -> RelayError {
    let status: StatusCode = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let code = extract_error_code(&text);
    let message = extract_error_message(&text).unwrap_or_else(|| {
        if text.trim().is_empty() {
            format!("upstream status {status}")
        } else {
            text.clone()
        }
    });
    RelayError::Upstream {
        status,
        code,
        message,
    }
}

pub fn apply_auth(
    req: reqwest::RequestBuilder,
    auth: &ChannelAuthConfig,
) -> reqwest::RequestBuilder {
    match auth.auth_type {
        ChannelAuthType::Bearer => req.bearer_auth(&auth.value),
        ChannelAuthType::Header => {
            let header_name = auth
                .header_name
                .clone()
                .unwrap_or_else(|| "x-api-key".to_string());
            req.header(header_name, &auth.value)
        }
        ChannelAuthType::Query => {
            let query_name = auth
                .query_name
                .clone()
                .unwrap_or_else(|| "api_key".to_string());
            req.query(&[(query_name, auth.value.as_str())])
        }
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

pub fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value.get("error").and_then(|v| v.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| error.as_str())
        .map(|s| s.to_string())
}
