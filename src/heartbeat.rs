use crate::frame::{self, FrameWriter, PingFrame};
use crate::scanner::StopReason;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Periodic keep-alive writer for one stream. Shares the frame writer lock
/// with the scan loop, so a ping never lands inside a data frame.
pub struct Heartbeat {
    writer: FrameWriter,
    interval: Duration,
    first_data: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<StopReason>,
}

impl Heartbeat {
    pub fn new(
        writer: FrameWriter,
        interval: Duration,
        first_data: Arc<AtomicBool>,
        stop_tx: mpsc::Sender<StopReason>,
    ) -> Self {
        Self {
            writer,
            interval: interval.max(Duration::from_millis(1)),
            first_data,
            stop_tx,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let kind = if self.first_data.load(Ordering::Acquire) {
                PingFrame::Ping
            } else {
                PingFrame::WaitingForUpstream
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = async {
                    let mut sink = self.writer.lock().await;
                    frame::ping_data(&mut **sink, kind).await
                } => result,
            };

            match result {
                Ok(()) => {
                    metrics::counter!("relay_heartbeat_frames_total").increment(1);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "heartbeat write failed, stopping stream");
                    let _ = self.stop_tx.try_send(StopReason::ClientGone);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::RecordingSink;

    fn spawn_heartbeat(
        sink: RecordingSink,
        interval: Duration,
    ) -> (
        JoinHandle<()>,
        CancellationToken,
        Arc<AtomicBool>,
        mpsc::Receiver<StopReason>,
    ) {
        let (stop_tx, stop_rx) = mpsc::channel(2);
        let first_data = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let handle = Heartbeat::new(
            FrameWriter::new(sink),
            interval,
            first_data.clone(),
            stop_tx,
        )
        .spawn(cancel.clone());
        (handle, cancel, first_data, stop_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_upstream_until_first_data_then_pings() {
        let recorder = RecordingSink::new();
        let (handle, cancel, first_data, _stop_rx) =
            spawn_heartbeat(recorder.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        first_data.store(true, Ordering::Release);
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            recorder.frames(),
            vec![
                ": WAITING FOR UPSTREAM \n\n".to_string(),
                ": WAITING FOR UPSTREAM \n\n".to_string(),
                ": PING\n\n".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_heartbeat_before_first_tick() {
        let recorder = RecordingSink::new();
        let (handle, cancel, _first_data, _stop_rx) =
            spawn_heartbeat(recorder.clone(), Duration::from_secs(10));
        cancel.cancel();
        handle.await.unwrap();
        assert!(recorder.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_posts_client_gone() {
        let recorder = RecordingSink::new();
        recorder.disconnect();
        let (handle, _cancel, _first_data, mut stop_rx) =
            spawn_heartbeat(recorder, Duration::from_secs(1));
        assert_eq!(stop_rx.recv().await, Some(StopReason::ClientGone));
        handle.await.unwrap();
    }
}
