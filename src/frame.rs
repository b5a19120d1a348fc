use crate::dto::{OpenAiError, RealtimeEvent};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("streaming error: flusher not found")]
    StreamingUnsupported,
    #[error("downstream connection closed")]
    ClientGone,
    #[error("encode frame failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket send failed: {0}")]
    WebSocket(String),
}

/// Downstream transport, shaped like an HTTP response writer: headers and
/// status first, then body bytes that only leave the process on `flush`.
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), FrameError>;

    fn can_flush(&self) -> bool;

    async fn flush(&mut self) -> Result<(), FrameError>;

    async fn close(&mut self) -> Result<(), FrameError>;

    fn set_header(&mut self, _name: HeaderName, _value: HeaderValue) {}

    fn write_header(&mut self, _status: StatusCode) {}

    /// Whether status and headers already left; after that, errors can only
    /// be reported in-band.
    fn committed(&self) -> bool {
        true
    }
}

/// Shared handle to one request's downstream. The mutex is the per-request
/// write lock: hold it for exactly one frame.
#[derive(Clone)]
pub struct FrameWriter {
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
}

impl FrameWriter {
    pub fn new<S: FrameSink + 'static>(sink: S) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn FrameSink>> {
        self.sink.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFrame {
    Ping,
    WaitingForUpstream,
}

impl PingFrame {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Ping => b": PING\n\n",
            Self::WaitingForUpstream => b": WAITING FOR UPSTREAM \n\n",
        }
    }
}

pub fn set_event_stream_headers(sink: &mut dyn FrameSink) {
    sink.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    sink.set_header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    sink.set_header(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    sink.set_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    sink.set_header(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
}

async fn finish_frame(sink: &mut dyn FrameSink) -> Result<(), FrameError> {
    if !sink.can_flush() {
        return Err(FrameError::StreamingUnsupported);
    }
    sink.flush().await
}

async fn write_data_line(sink: &mut dyn FrameSink, payload: &str) -> Result<(), FrameError> {
    sink.write(b"data: ").await?;
    sink.write(payload.as_bytes()).await?;
    sink.write(b"\n\n").await
}

pub async fn event_data(
    sink: &mut dyn FrameSink,
    kind: &str,
    payload: &str,
) -> Result<(), FrameError> {
    sink.write(format!("event: {kind}\n").as_bytes()).await?;
    write_data_line(sink, payload).await?;
    finish_frame(sink).await
}

pub async fn string_data(sink: &mut dyn FrameSink, payload: &str) -> Result<(), FrameError> {
    write_data_line(sink, payload).await?;
    finish_frame(sink).await
}

pub async fn object_data<T: Serialize + Sync + ?Sized>(
    sink: &mut dyn FrameSink,
    object: &T,
) -> Result<(), FrameError> {
    let payload = serde_json::to_string(object)?;
    string_data(sink, &payload).await
}

pub async fn ping_data(sink: &mut dyn FrameSink, kind: PingFrame) -> Result<(), FrameError> {
    sink.write(kind.as_bytes()).await?;
    finish_frame(sink).await
}

pub async fn done(sink: &mut dyn FrameSink) -> Result<(), FrameError> {
    string_data(sink, DONE_SENTINEL).await
}

pub async fn wss_string(sink: &mut dyn FrameSink, payload: &str) -> Result<(), FrameError> {
    sink.write(payload.as_bytes()).await?;
    finish_frame(sink).await
}

pub async fn wss_object<T: Serialize + Sync + ?Sized>(
    sink: &mut dyn FrameSink,
    object: &T,
) -> Result<(), FrameError> {
    let payload = serde_json::to_string(object)?;
    wss_string(sink, &payload).await
}

pub async fn wss_error(
    sink: &mut dyn FrameSink,
    event_id: &str,
    error: OpenAiError,
) -> Result<(), FrameError> {
    let event = RealtimeEvent {
        event_type: "error".to_string(),
        event_id: event_id.to_string(),
        error: Some(error),
        response: None,
        delta: None,
    };
    wss_object(sink, &event).await
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// HTTP downstream backed by channels: the head is handed over once, body
/// chunks follow one per flush.
pub struct HttpDownstream {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    pending: BytesMut,
}

pub struct PendingResponse {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::Receiver<Bytes>,
}

impl HttpDownstream {
    pub fn channel(buffer: usize) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                head_tx: Some(head_tx),
                body_tx: Some(body_tx),
                pending: BytesMut::new(),
            },
            PendingResponse { head_rx, body_rx },
        )
    }

    fn commit(&mut self) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(ResponseHead {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
            });
        }
    }
}

#[async_trait]
impl FrameSink for HttpDownstream {
    async fn write(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        self.commit();
        if self.body_tx.is_none() {
            return Err(FrameError::ClientGone);
        }
        self.pending.extend_from_slice(buf);
        Ok(())
    }

    fn can_flush(&self) -> bool {
        true
    }

    async fn flush(&mut self) -> Result<(), FrameError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let body_tx = self.body_tx.as_ref().ok_or(FrameError::ClientGone)?;
        let chunk = self.pending.split().freeze();
        body_tx
            .send(chunk)
            .await
            .map_err(|_| FrameError::ClientGone)
    }

    async fn close(&mut self) -> Result<(), FrameError> {
        self.commit();
        self.flush().await?;
        match self.body_tx.take() {
            Some(body_tx) if body_tx.is_closed() => Err(FrameError::ClientGone),
            _ => Ok(()),
        }
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.head_tx.is_some() {
            self.headers.insert(name, value);
        }
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.head_tx.is_some() {
            self.status = status;
            self.commit();
        }
    }

    fn committed(&self) -> bool {
        self.head_tx.is_none()
    }
}

impl PendingResponse {
    /// Waits for the relay task to either commit a response head or finish
    /// without one, in which case its error becomes the response.
    pub async fn into_response(self, relay: JoinHandle<AppResult<()>>) -> Response {
        let PendingResponse { head_rx, body_rx } = self;
        match head_rx.await {
            Ok(head) => {
                let stream = tokio_stream::wrappers::ReceiverStream::new(body_rx)
                    .map(Ok::<_, Infallible>);
                let mut response = Response::new(Body::from_stream(stream));
                *response.status_mut() = head.status;
                *response.headers_mut() = head.headers;
                response
            }
            Err(_) => match relay.await {
                Ok(Err(err)) => err.into_response(),
                Ok(Ok(())) => StatusCode::OK.into_response(),
                Err(err) => AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "relay_task_failed",
                    err.to_string(),
                )
                .into_response(),
            },
        }
    }
}

/// WebSocket downstream: everything written between two flushes becomes one
/// text frame.
pub struct WsDownstream {
    sink: SplitSink<WebSocket, Message>,
    pending: BytesMut,
}

impl WsDownstream {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            pending: BytesMut::new(),
        }
    }
}

#[async_trait]
impl FrameSink for WsDownstream {
    async fn write(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        self.pending.extend_from_slice(buf);
        Ok(())
    }

    fn can_flush(&self) -> bool {
        true
    }

    async fn flush(&mut self) -> Result<(), FrameError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = self.pending.split().freeze();
        let text = String::from_utf8_lossy(&frame).into_owned();
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| FrameError::WebSocket(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), FrameError> {
        self.flush().await?;
        self.sink
            .close()
            .await
            .map_err(|err| FrameError::WebSocket(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{FrameError, FrameSink};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Record {
        Write(Vec<u8>),
        Flush,
    }

    /// Fake transport that records every write and flush boundary.
    #[derive(Clone)]
    pub struct RecordingSink {
        pub records: Arc<Mutex<Vec<Record>>>,
        pub headers: Arc<Mutex<HeaderMap>>,
        pub status: Arc<Mutex<Option<StatusCode>>>,
        flushable: bool,
        yield_between_writes: bool,
        gone: Arc<AtomicBool>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                records: Arc::new(Mutex::new(Vec::new())),
                headers: Arc::new(Mutex::new(HeaderMap::new())),
                status: Arc::new(Mutex::new(None)),
                flushable: true,
                yield_between_writes: false,
                gone: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn unflushable() -> Self {
            Self {
                flushable: false,
                ..Self::new()
            }
        }

        pub fn yielding() -> Self {
            Self {
                yield_between_writes: true,
                ..Self::new()
            }
        }

        pub fn disconnect(&self) {
            self.gone.store(true, Ordering::SeqCst);
        }

        /// Bytes written between consecutive flushes, one entry per flush.
        pub fn frames(&self) -> Vec<String> {
            let records = self.records.lock().unwrap();
            let mut frames = Vec::new();
            let mut current = Vec::new();
            for record in records.iter() {
                match record {
                    Record::Write(bytes) => current.extend_from_slice(bytes),
                    Record::Flush => {
                        frames.push(String::from_utf8_lossy(&current).into_owned());
                        current.clear();
                    }
                }
            }
            frames
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write(&mut self, buf: &[u8]) -> Result<(), FrameError> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(FrameError::ClientGone);
            }
            self.records
                .lock()
                .unwrap()
                .push(Record::Write(buf.to_vec()));
            if self.yield_between_writes {
                tokio::task::yield_now().await;
            }
            Ok(())
        }

        fn can_flush(&self) -> bool {
            self.flushable
        }

        async fn flush(&mut self) -> Result<(), FrameError> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(FrameError::ClientGone);
            }
            self.records.lock().unwrap().push(Record::Flush);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), FrameError> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(FrameError::ClientGone);
            }
            Ok(())
        }

        fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
            self.headers.lock().unwrap().insert(name, value);
        }

        fn write_header(&mut self, status: StatusCode) {
            *self.status.lock().unwrap() = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn string_data_writes_one_sse_frame() {
        let recorder = RecordingSink::new();
        let mut sink = recorder.clone();
        string_data(&mut sink, "{\"a\":1}").await.unwrap();
        done(&mut sink).await.unwrap();
        assert_eq!(
            recorder.frames(),
            vec!["data: {\"a\":1}\n\n".to_string(), "data: [DONE]\n\n".to_string()]
        );
    }

    #[tokio::test]
    async fn event_data_prefixes_the_event_name() {
        let recorder = RecordingSink::new();
        let mut sink = recorder.clone();
        event_data(&mut sink, "error", "{}").await.unwrap();
        assert_eq!(recorder.frames(), vec!["event: error\ndata: {}\n\n".to_string()]);
    }

    #[tokio::test]
    async fn ping_frames_are_comments() {
        let recorder = RecordingSink::new();
        let mut sink = recorder.clone();
        ping_data(&mut sink, PingFrame::Ping).await.unwrap();
        ping_data(&mut sink, PingFrame::WaitingForUpstream)
            .await
            .unwrap();
        assert_eq!(
            recorder.frames(),
            vec![
                ": PING\n\n".to_string(),
                ": WAITING FOR UPSTREAM \n\n".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unflushable_sink_reports_streaming_unsupported() {
        let mut sink = RecordingSink::unflushable();
        let err = string_data(&mut sink, "x").await.unwrap_err();
        assert!(matches!(err, FrameError::StreamingUnsupported));
        let err = ping_data(&mut sink, PingFrame::Ping).await.unwrap_err();
        assert!(matches!(err, FrameError::StreamingUnsupported));
    }

    #[tokio::test]
    async fn event_stream_headers_are_set() {
        let recorder = RecordingSink::new();
        let mut sink = recorder.clone();
        set_event_stream_headers(&mut sink);
        let headers = recorder.headers.lock().unwrap();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::TRANSFER_ENCODING], "chunked");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[tokio::test]
    async fn wss_error_wraps_error_in_realtime_event() {
        let recorder = RecordingSink::new();
        let mut sink = recorder.clone();
        wss_error(
            &mut sink,
            "evt_1",
            OpenAiError {
                message: "boom".to_string(),
                error_type: "relay_error".to_string(),
                param: None,
                code: Some("do_request_failed".to_string()),
            },
        )
        .await
        .unwrap();
        let frames = recorder.frames();
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["event_id"], "evt_1");
        assert_eq!(value["error"]["code"], "do_request_failed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ping_and_data_frames_never_interleave() {
        let recorder = RecordingSink::yielding();
        let writer = FrameWriter::new(recorder.clone());
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let data_writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let mut sink = data_writer.lock().await;
                    let payload = serde_json::json!({ "worker": worker, "i": i });
                    object_data(&mut **sink, &payload).await.unwrap();
                }
            }));
            let ping_writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut sink = ping_writer.lock().await;
                    ping_data(&mut **sink, PingFrame::Ping).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames = recorder.frames();
        assert_eq!(frames.len(), 400);
        for frame in frames {
            if frame == ": PING\n\n" {
                continue;
            }
            assert!(frame.starts_with("data: {"), "torn frame: {frame:?}");
            assert!(frame.ends_with("}\n\n"), "torn frame: {frame:?}");
            assert_eq!(frame.matches("data: ").count(), 1, "torn frame: {frame:?}");
            assert!(!frame.contains("PING"), "torn frame: {frame:?}");
        }
    }

    #[tokio::test]
    async fn http_downstream_streams_committed_head_and_body() {
        let (mut downstream, pending) = HttpDownstream::channel(8);
        let relay = tokio::spawn(async move {
            set_event_stream_headers(&mut downstream);
            string_data(&mut downstream, "one").await.unwrap();
            done(&mut downstream).await.unwrap();
            downstream.close().await.unwrap();
            Ok(())
        });
        let response = pending.into_response(relay).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"data: one\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn http_downstream_uses_relay_error_when_nothing_was_committed() {
        let (downstream, pending) = HttpDownstream::channel(8);
        let relay = tokio::spawn(async move {
            drop(downstream);
            Err(AppError::new(StatusCode::FORBIDDEN, "insufficient_user_quota", "no quota"))
        });
        let response = pending.into_response(relay).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "insufficient_user_quota");
    }

    #[tokio::test]
    async fn http_downstream_write_fails_once_client_is_gone() {
        let (mut downstream, pending) = HttpDownstream::channel(1);
        drop(pending);
        let err = string_data(&mut downstream, "x").await.unwrap_err();
        assert!(matches!(err, FrameError::ClientGone));
    }
}
