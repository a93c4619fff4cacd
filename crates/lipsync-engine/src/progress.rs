//! Relay from a running job to the session's outbound frames.
//!
//! Publishers never block and work from any thread, including blocking-pool
//! workers. The drain forwards messages in publish order and stops when every
//! publisher is gone and the queue is empty, when the sink closes, or shortly
//! after cancellation. One channel per request.

use std::time::Duration;

use async_trait::async_trait;
use lipsync_core::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// One line of job progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressMessage {
    /// Human-readable text.
    pub text: String,
}

/// Create a bridge whose drain wakes at least every `poll_interval`.
pub fn channel(poll_interval: Duration) -> (ProgressPublisher, ProgressDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressPublisher { tx },
        ProgressDrain { rx, poll_interval },
    )
}

/// Producer half. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ProgressPublisher {
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressPublisher {
    /// Enqueue `text`. Returns `false` once the drain has stopped.
    pub fn publish(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(ProgressMessage { text: text.into() })
            .is_ok()
    }

    /// Whether the drain has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where drained messages go.
#[async_trait]
pub trait ProgressSink: Send + Sync + 'static {
    /// Deliver one message. `false` means the sink is gone.
    async fn forward(&self, message: ProgressMessage) -> bool;
}

#[async_trait]
impl ProgressSink for mpsc::Sender<Frame> {
    async fn forward(&self, message: ProgressMessage) -> bool {
        self.send(Frame::processing(message.text)).await.is_ok()
    }
}

/// Why a drain loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All publishers dropped and the queue is empty.
    Exhausted,
    /// The sink stopped accepting messages.
    SinkClosed,
    /// Cancelled before the queue was exhausted.
    Cancelled,
}

/// Summary returned by [`ProgressDrain::drain_loop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages delivered to the sink.
    pub forwarded: u64,
    /// Termination reason.
    pub outcome: DrainOutcome,
}

/// Consumer half.
#[derive(Debug)]
pub struct ProgressDrain {
    rx: mpsc::UnboundedReceiver<ProgressMessage>,
    poll_interval: Duration,
}

impl ProgressDrain {
    /// Forward messages to `sink` until exhausted, closed, or cancelled.
    /// A slow sink is waited on, never skipped. Cancellation is observed
    /// within one `poll_interval`, including while blocked on the sink.
    pub async fn drain_loop<S: ProgressSink>(
        mut self,
        sink: S,
        cancel: CancellationToken,
    ) -> DrainReport {
        let mut forwarded = 0;
        let outcome = loop {
            if cancel.is_cancelled() {
                break DrainOutcome::Cancelled;
            }
            match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                Ok(Some(message)) => {
                    trace!(text = %message.text, "forwarding progress");
                    tokio::select! {
                        delivered = sink.forward(message) => {
                            if !delivered {
                                break DrainOutcome::SinkClosed;
                            }
                            forwarded += 1;
                        }
                        () = cancel.cancelled() => break DrainOutcome::Cancelled,
                    }
                }
                Ok(None) => break DrainOutcome::Exhausted,
                Err(_) => {}
            }
        };
        self.rx.close();
        DrainReport { forwarded, outcome }
    }
}
