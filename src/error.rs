use crate::dto::OpenAiError;
use crate::frame::FrameError;
use crate::quota::{LedgerError, LedgerErrorKind};
use crate::scanner::ScanError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn to_openai_error(&self) -> OpenAiError {
        OpenAiError {
            message: self.message.clone(),
            error_type: self.error_type.clone(),
            param: self.param.clone(),
            code: Some(self.code.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of a single relayed request. Every variant is scoped to that
/// request; none of them is allowed to take the process down.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid model mapping: {0}")]
    InvalidMapping(#[source] serde_json::Error),
    #[error("invalid api type: {0}")]
    InvalidApiType(String),
    #[error("load relay settings failed: {0}")]
    Settings(String),
    #[error("{0}")]
    Quota(#[from] LedgerError),
    #[error("upstream request failed: {0}")]
    DoRequestFailed(String),
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
    #[error("read upstream response body failed: {0}")]
    ReadResponseBody(String),
    #[error("decode upstream response body failed: {0}")]
    BadResponseBody(#[source] serde_json::Error),
    #[error("copy response body failed: {0}")]
    CopyResponseBody(#[source] FrameError),
    #[error("close response body failed: {0}")]
    CloseResponseBody(#[source] FrameError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidMapping(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidApiType(_) => StatusCode::BAD_REQUEST,
            Self::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Quota(err) => match err.kind {
                LedgerErrorKind::InsufficientQuota => StatusCode::FORBIDDEN,
                LedgerErrorKind::NotFound => StatusCode::UNAUTHORIZED,
                LedgerErrorKind::Conflict | LedgerErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::DoRequestFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => *status,
            Self::ReadResponseBody(_) | Self::BadResponseBody(_) => StatusCode::BAD_GATEWAY,
            Self::CopyResponseBody(_) | Self::CloseResponseBody(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Frame(_) | Self::Scan(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> String {
        match self {
            Self::InvalidMapping(_) => "unmarshal_model_mapping_failed".to_string(),
            Self::InvalidApiType(_) => "invalid_api_type".to_string(),
            Self::Settings(_) => "settings_load_failed".to_string(),
            Self::Quota(err) => match err.kind {
                LedgerErrorKind::InsufficientQuota => "insufficient_user_quota".to_string(),
                LedgerErrorKind::NotFound => "user_not_found".to_string(),
                LedgerErrorKind::Conflict => "quota_conflict".to_string(),
                LedgerErrorKind::Internal => "pre_consume_quota_failed".to_string(),
            },
            Self::DoRequestFailed(_) => "do_request_failed".to_string(),
            Self::Upstream { code, .. } => code
                .clone()
                .unwrap_or_else(|| "upstream_error".to_string()),
            Self::ReadResponseBody(_) => "read_response_body_failed".to_string(),
            Self::BadResponseBody(_) => "bad_response_body".to_string(),
            Self::CopyResponseBody(_) => "copy_response_body_failed".to_string(),
            Self::CloseResponseBody(_) => "close_response_body_failed".to_string(),
            Self::Frame(_) => "stream_write_failed".to_string(),
            Self::Scan(_) => "stream_scan_failed".to_string(),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Upstream { .. } | Self::ReadResponseBody(_) | Self::BadResponseBody(_) => {
                "upstream_error"
            }
            Self::Quota(_) => "insufficient_quota",
            Self::InvalidApiType(_) => "invalid_request_error",
            _ => "relay_error",
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        AppError::new(err.status(), err.code(), err.to_string()).with_type(err.error_type())
    }
}
