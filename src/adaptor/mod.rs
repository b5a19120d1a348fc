pub mod realtime;
pub mod xai;

use crate::dto::Usage;
use crate::error::RelayError;
use crate::frame::FrameWriter;
use crate::relay_info::RelayInfo;
use crate::settings::RelaySettings;
use crate::tokens::TokenEstimator;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub type UpstreamSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// An open upstream exchange, produced by `do_request` and consumed by
/// `do_response`.
pub enum Upstream {
    Http(reqwest::Response),
    WebSocket(Box<UpstreamSocket>),
}

/// Shared collaborators handed to every adaptor call.
#[derive(Clone)]
pub struct RelayContext {
    pub http: reqwest::Client,
    pub settings: Arc<RelaySettings>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub downstream: FrameWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    XAi,
    OpenAiRealtime,
}

impl ApiType {
    pub fn from_tag(tag: &str) -> Result<Self, RelayError> {
        match tag {
            "xai" => Ok(Self::XAi),
            "openai_realtime" => Ok(Self::OpenAiRealtime),
            other => Err(RelayError::InvalidApiType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XAi => "xai",
            Self::OpenAiRealtime => "openai_realtime",
        }
    }
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn init(&self, _info: &mut RelayInfo) {}

    async fn do_request(
        &self,
        ctx: &RelayContext,
        info: &mut RelayInfo,
        body: Option<Bytes>,
    ) -> Result<Upstream, RelayError>;

    async fn do_response(
        &self,
        ctx: &RelayContext,
        upstream: Upstream,
        info: &mut RelayInfo,
    ) -> Result<Usage, RelayError>;
}

pub fn adaptor_for(api_type: ApiType) -> Box<dyn Adaptor> {
    match api_type {
        ApiType::XAi => Box::new(xai::XaiAdaptor),
        ApiType::OpenAiRealtime => Box::new(realtime::RealtimeAdaptor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_is_an_invalid_api_type() {
        assert_eq!(ApiType::from_tag("xai").unwrap(), ApiType::XAi);
        assert_eq!(
            ApiType::from_tag("openai_realtime").unwrap().as_str(),
            "openai_realtime"
        );
        let err = ApiType::from_tag("palm").unwrap_err();
        assert_eq!(err.code(), "invalid_api_type");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
