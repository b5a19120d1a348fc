use crate::frame::{DONE_SENTINEL, FrameSink, FrameWriter};
use crate::heartbeat::Heartbeat;
use crate::relay_info::RelayInfo;
use crate::settings::RelaySettings;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;

pub const INITIAL_SCANNER_BUFFER_SIZE: usize = 1 << 20;
pub const MAX_SCANNER_BUFFER_SIZE: usize = 10 << 20;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_secs(120);

/// Reasoning models that may think silently for a long time before the first
/// token; they get twice the idle budget.
const SLOW_MODEL_PREFIXES: [&str; 2] = ["o1", "o3"];
const MIN_LINE_LEN: usize = 6;
const DATA_PREFIX: &str = "data:";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("stream scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSettings {
    pub enabled: bool,
    pub interval: Duration,
}

/// Settings captured once when a stream starts; later changes to the settings
/// table do not affect a stream already in flight.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub idle_timeout: Duration,
    pub ping: PingSettings,
    pub model_name: String,
}

impl ScannerConfig {
    pub fn from_settings(settings: &RelaySettings, model_name: &str) -> Self {
        let idle_timeout = if settings.streaming_timeout_seconds == 0 {
            DEFAULT_STREAMING_TIMEOUT
        } else {
            Duration::from_secs(settings.streaming_timeout_seconds)
        };
        let interval = if settings.ping_interval_seconds == 0 {
            DEFAULT_PING_INTERVAL
        } else {
            Duration::from_secs(settings.ping_interval_seconds)
        };
        Self {
            idle_timeout,
            ping: PingSettings {
                enabled: settings.ping_interval_enabled,
                interval,
            },
            model_name: model_name.to_string(),
        }
    }

    pub fn effective_idle_timeout(&self) -> Duration {
        if SLOW_MODEL_PREFIXES
            .iter()
            .any(|prefix| self.model_name.starts_with(prefix))
        {
            self.idle_timeout * 2
        } else {
            self.idle_timeout
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    TimedOut,
    Completed,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    IdleTimeout,
    ClientGone,
}

impl StopReason {
    fn terminal_state(self) -> StreamState {
        match self {
            StopReason::Completed => StreamState::Completed,
            StopReason::IdleTimeout => StreamState::TimedOut,
            StopReason::ClientGone => StreamState::Cancelled,
        }
    }
}

/// Per-provider transform for one `data:` payload. Runs with the frame
/// writer lock held; returning `false` ends the stream.
#[async_trait]
pub trait LineHandler: Send {
    async fn handle(&mut self, payload: &str, sink: &mut dyn FrameSink) -> bool;
}

pub struct ScanOutcome<H> {
    pub handler: H,
    /// Terminal state the stream reached before it was closed.
    pub state: StreamState,
}

/// Splits the body on `\n`, capping a single line at the scanner buffer size.
fn line_frames<R: AsyncRead>(body: R) -> FramedRead<R, AnyDelimiterCodec> {
    let codec = AnyDelimiterCodec::new_with_max_length(
        b"\n".to_vec(),
        Vec::new(),
        MAX_SCANNER_BUFFER_SIZE,
    );
    FramedRead::with_capacity(body, codec, INITIAL_SCANNER_BUFFER_SIZE)
}

fn decode_line(chunk: &[u8]) -> String {
    let line = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(line).into_owned()
}

/// Returns the payload of a line worth handing to the handler, or `None`
/// for comments, blank lines and other SSE fields.
fn data_payload(line: &str) -> Option<&str> {
    if line.len() < MIN_LINE_LEN {
        return None;
    }
    if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
        return Some(rest.trim_start_matches(' '));
    }
    if line.starts_with(DONE_SENTINEL) {
        return Some(line);
    }
    None
}

struct ScanTaskOutput<H> {
    handler: H,
    first_response: Option<Instant>,
}

struct ScanTask<R, H> {
    lines: FramedRead<R, AnyDelimiterCodec>,
    writer: FrameWriter,
    handler: H,
    activity_tx: watch::Sender<Instant>,
    first_data: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<StopReason>,
}

impl<R, H> ScanTask<R, H>
where
    R: AsyncRead + Unpin + Send,
    H: LineHandler,
{
    async fn run(mut self, cancel: CancellationToken) -> ScanTaskOutput<H> {
        let mut first_response = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.lines.next() => next,
            };
            let _ = self.activity_tx.send(Instant::now());

            let line = match next {
                Some(Ok(chunk)) => decode_line(&chunk),
                None => break,
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    tracing::warn!(
                        max_bytes = MAX_SCANNER_BUFFER_SIZE,
                        "upstream line exceeds scanner buffer, ending stream"
                    );
                    break;
                }
                Some(Err(AnyDelimiterCodecError::Io(err))) => {
                    tracing::warn!(error = %err, "upstream stream read failed");
                    break;
                }
            };

            let Some(payload) = data_payload(&line) else {
                continue;
            };
            if payload.starts_with(DONE_SENTINEL) {
                break;
            }

            if !self.first_data.swap(true, Ordering::AcqRel) {
                first_response = Some(Instant::now());
            }

            let writer = &self.writer;
            let handler = &mut self.handler;
            let keep_going = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                keep_going = async {
                    let mut sink = writer.lock().await;
                    handler.handle(payload, &mut **sink).await
                } => keep_going,
            };
            if !keep_going {
                break;
            }
        }

        let _ = self.stop_tx.try_send(StopReason::Completed);
        ScanTaskOutput {
            handler: self.handler,
            first_response,
        }
    }
}

pub struct StreamScanner {
    config: ScannerConfig,
    state: StreamState,
}

impl StreamScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            config,
            state: StreamState::Idle,
        }
    }

    fn transition(&mut self, next: StreamState) {
        tracing::debug!(
            from = ?self.state,
            to = ?next,
            model = %self.config.model_name,
            "stream state"
        );
        self.state = next;
    }

    /// Drives one upstream body to a terminal state, then tears down the
    /// heartbeat and the scan task before returning the handler.
    pub async fn run<R, H>(
        mut self,
        body: R,
        writer: FrameWriter,
        handler: H,
        info: &mut RelayInfo,
    ) -> Result<ScanOutcome<H>, ScanError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        H: LineHandler + 'static,
    {
        let idle_timeout = self.config.effective_idle_timeout();
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let (stop_tx, mut stop_rx) = mpsc::channel::<StopReason>(2);
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let first_data = Arc::new(AtomicBool::new(false));

        self.transition(StreamState::Running);

        let heartbeat = self.config.ping.enabled.then(|| {
            Heartbeat::new(
                writer.clone(),
                self.config.ping.interval,
                first_data.clone(),
                stop_tx.clone(),
            )
            .spawn(cancel.clone())
        });

        let scan_task = ScanTask {
            lines: line_frames(body),
            writer,
            handler,
            activity_tx,
            first_data,
            stop_tx: stop_tx.clone(),
        };
        let scan_handle = tokio::spawn(scan_task.run(cancel.clone()));

        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        let reason = loop {
            tokio::select! {
                reason = stop_rx.recv() => break reason.unwrap_or(StopReason::Completed),
                () = &mut idle => {
                    let deadline = *activity_rx.borrow() + idle_timeout;
                    if deadline > Instant::now() {
                        idle.as_mut().reset(deadline);
                        continue;
                    }
                    tracing::warn!(
                        model = %self.config.model_name,
                        timeout_secs = idle_timeout.as_secs(),
                        "upstream stream idle timeout"
                    );
                    let _ = stop_tx.try_send(StopReason::IdleTimeout);
                    break stop_rx.recv().await.unwrap_or(StopReason::IdleTimeout);
                }
            }
        };
        let terminal = reason.terminal_state();
        self.transition(terminal);

        drop(guard);
        if let Some(heartbeat) = heartbeat {
            if let Err(err) = heartbeat.await {
                tracing::warn!(error = %err, "heartbeat task failed");
            }
        }
        let output = scan_handle.await?;
        self.transition(StreamState::Closed);

        if let Some(first_response) = output.first_response {
            info.first_response_time = Some(first_response);
            metrics::histogram!("relay_first_response_seconds")
                .record(first_response.duration_since(info.started_at).as_secs_f64());
        }

        Ok(ScanOutcome {
            handler: output.handler,
            state: terminal,
        })
    }
}

/// Adapts an upstream HTTP body into the byte reader the scanner consumes.
pub fn body_reader(response: reqwest::Response) -> impl AsyncRead + Send + Unpin + 'static {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    tokio_util::io::StreamReader::new(Box::pin(stream))
}
