use crate::config::ChannelConfig;
use axum::extract::ws::WebSocket;
use futures_util::stream::SplitStream;
use tokio::time::Instant;

/// Mutable context for one relayed request. Created by the handler, threaded
/// by `&mut` through the orchestrator, adaptor and scanner.
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: String,
    pub group: String,
    pub api_type: String,
    pub channel: ChannelConfig,
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub is_stream: bool,
    pub include_usage: bool,
    pub prompt_tokens: u64,
    pub use_price: bool,
    pub started_at: Instant,
    pub first_response_time: Option<Instant>,
    /// Read half of the client WebSocket for duplex relays.
    pub client_ws: Option<SplitStream<WebSocket>>,
}

impl RelayInfo {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            request_id: request_id.into(),
            user_id: String::new(),
            group: "default".to_string(),
            api_type: String::new(),
            channel: ChannelConfig::default(),
            origin_model_name: model.clone(),
            upstream_model_name: model,
            is_stream: false,
            include_usage: false,
            prompt_tokens: 0,
            use_price: false,
            started_at: Instant::now(),
            first_response_time: None,
            client_ws: None,
        }
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.api_type = channel.api_type.clone();
        self.channel = channel;
        self
    }

    pub fn set_first_response_time(&mut self) {
        if self.first_response_time.is_none() {
            self.first_response_time = Some(Instant::now());
        }
    }

    pub fn response_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id)
    }

    pub fn realtime_event_id(&self) -> String {
        format!("evt_{}", self.request_id)
    }
}
