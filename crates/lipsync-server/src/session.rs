//! One WebSocket connection.
//!
//! The socket is split into a reader task and a writer task. The orchestrator
//! sits between them: it takes inbound text from the reader, runs at most one
//! request at a time on its own task, queues the rest, and hands every frame
//! to the writer. Progress frames reach the writer through the same channel
//! before the request's terminal frame does.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use lipsync_core::{Frame, InboundRequest, JobId};
use lipsync_engine::{EngineError, JobPipeline};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ServerConfig;
use crate::metrics::{
    REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
};
use crate::registry::{Registration, SessionHandle, SessionState};

/// Why a session ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The socket failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// No inbound traffic, not even pongs, for too long.
    #[error("no traffic for {0:?}")]
    HeartbeatTimeout(Duration),
    /// The writer task is gone.
    #[error("outbound channel closed")]
    WriterClosed,
}

/// What the reader task saw.
#[derive(Debug)]
pub enum Inbound {
    /// A request message.
    Text(String),
    /// Ping or pong traffic.
    Activity,
    /// The client closed the connection.
    Closed,
    /// The socket failed.
    Failed(SessionError),
}

/// Forward socket messages as [`Inbound`] events until the socket closes or
/// `events` is dropped.
pub async fn read_loop<S, E>(mut stream: S, events: mpsc::Sender<Inbound>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(next) = stream.next().await {
        let event = match next {
            Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Message::Ping(_) | Message::Pong(_)) => Inbound::Activity,
            Ok(Message::Close(_)) => Inbound::Closed,
            Err(e) => Inbound::Failed(SessionError::Transport(e.to_string())),
        };
        let last = matches!(event, Inbound::Closed | Inbound::Failed(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
    let _ = events.send(Inbound::Closed).await;
}

/// Write frames as text messages and ping every `heartbeat`. Sends a close
/// message once `frames` is exhausted.
pub async fn write_loop<S, E>(
    mut sink: S,
    mut frames: mpsc::Receiver<Frame>,
    heartbeat: Duration,
) -> Result<(), SessionError>
where
    S: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let transport = |e: E| SessionError::Transport(e.to_string());
    let mut ping = tokio::time::interval(heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                sink.send(Message::Text(frame.to_json().into())).await.map_err(transport)?;
            }
            _ = ping.tick() => {
                sink.send(Message::Ping(Vec::new().into())).await.map_err(transport)?;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

type RequestResult = Result<Frame, EngineError>;

struct InFlight {
    job: JobId,
    started: Instant,
    cancel: CancellationToken,
    task: JoinHandle<RequestResult>,
}

/// Await the running request, or never if there is none.
async fn join_in_flight(slot: &mut Option<InFlight>) -> Result<RequestResult, JoinError> {
    match slot {
        Some(in_flight) => (&mut in_flight.task).await,
        None => std::future::pending().await,
    }
}

/// Validate, execute and encode one request.
async fn run_request(
    pipeline: Arc<JobPipeline>,
    handle: Arc<SessionHandle>,
    job: JobId,
    text: String,
    sink: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> RequestResult {
    let payloads = tokio::task::spawn_blocking(move || InboundRequest::parse(&text)?.into_payloads())
        .await
        .map_err(|e| EngineError::Internal(format!("request decoding failed: {e}")))??;

    let output = pipeline
        .execute(job, payloads, sink, cancel, &*handle)
        .await?;
    tokio::task::spawn_blocking(move || Frame::success(&output.video))
        .await
        .map_err(|e| EngineError::Internal(format!("result encoding failed: {e}")))
}

/// Drives one session's requests.
pub struct SessionOrchestrator {
    handle: Arc<SessionHandle>,
    pipeline: Arc<JobPipeline>,
    config: Arc<ServerConfig>,
    frames: mpsc::Sender<Frame>,
    queue: VecDeque<String>,
    in_flight: Option<InFlight>,
}

impl SessionOrchestrator {
    /// Orchestrator sending frames to `frames`.
    pub fn new(
        handle: Arc<SessionHandle>,
        pipeline: Arc<JobPipeline>,
        config: Arc<ServerConfig>,
        frames: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            handle,
            pipeline,
            config,
            frames,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Process events until the client leaves, the session is cancelled, or
    /// the connection breaks. `Ok` means an orderly end.
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<Inbound>) -> Result<(), SessionError> {
        let cancel = self.handle.cancel_token().clone();
        let frames = self.frames.clone();
        let mut liveness = tokio::time::interval(self.config.heartbeat_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(Inbound::Text(text)) => {
                        self.handle.touch();
                        self.accept(text).await?;
                    }
                    Some(Inbound::Activity) => self.handle.touch(),
                    Some(Inbound::Closed) | None => return Ok(()),
                    Some(Inbound::Failed(e)) => return Err(e),
                },
                joined = join_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    if let Some(done) = self.in_flight.take() {
                        let frame = self.terminal_frame(&done, joined);
                        self.send(frame).await?;
                        self.handle.set_state(SessionState::Idle);
                        self.start_next();
                    }
                }
                () = cancel.cancelled() => return Ok(()),
                () = frames.closed() => return Err(SessionError::WriterClosed),
                _ = liveness.tick() => {
                    if self.handle.idle_for() > self.config.heartbeat_timeout {
                        return Err(SessionError::HeartbeatTimeout(self.config.heartbeat_timeout));
                    }
                }
            }
        }
    }

    /// Start `text` now, queue it, or refuse it with `busy`.
    async fn accept(&mut self, text: String) -> Result<(), SessionError> {
        if self.in_flight.is_none() {
            self.handle.set_state(SessionState::Receiving);
            self.start(text);
            return Ok(());
        }
        if self.queue.len() < self.config.max_queued_requests {
            self.queue.push_back(text);
            debug!(queued = self.queue.len(), "request queued");
            return Ok(());
        }

        let busy = EngineError::Busy(self.config.max_queued_requests);
        warn!(limit = self.config.max_queued_requests, "request refused, queue full");
        counter!(REQUESTS_TOTAL, "outcome" => busy.code()).increment(1);
        self.send(busy.to_frame()).await
    }

    fn start_next(&mut self) {
        if let Some(text) = self.queue.pop_front() {
            self.start(text);
        }
    }

    fn start(&mut self, text: String) {
        let job = JobId::new();
        let cancel = self.handle.cancel_token().child_token();
        self.handle.set_state(SessionState::Validating);
        info!(job = %job, bytes = text.len(), "request accepted");

        let task = tokio::spawn(
            run_request(
                Arc::clone(&self.pipeline),
                Arc::clone(&self.handle),
                job.clone(),
                text,
                self.frames.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("request", job = %job)),
        );
        self.in_flight = Some(InFlight {
            job,
            started: Instant::now(),
            cancel,
            task,
        });
    }

    /// Terminal frame for a finished request. Records request metrics.
    fn terminal_frame(&self, done: &InFlight, joined: Result<RequestResult, JoinError>) -> Frame {
        let frame = match joined {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!(job = %done.job, code = e.code(), error = %e, "request failed");
                self.handle.set_state(SessionState::Error);
                e.to_frame()
            }
            Err(e) => {
                error!(job = %done.job, error = %e, "request task failed");
                self.handle.set_state(SessionState::Error);
                EngineError::Internal(format!("request task failed: {e}")).to_frame()
            }
        };

        let outcome = match &frame {
            Frame::Error { code, .. } => code.clone().unwrap_or_else(|| "error".into()),
            _ => "success".into(),
        };
        counter!(REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        histogram!(REQUEST_DURATION_SECONDS).record(done.started.elapsed().as_secs_f64());
        frame
    }

    async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SessionError::WriterClosed)
    }

    /// Cancel the running request and wait up to the shutdown grace for its
    /// cleanup. Queued requests are dropped.
    pub async fn close(&mut self) {
        self.handle.begin_close();
        self.queue.clear();

        if let Some(mut in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            match tokio::time::timeout(self.config.shutdown_grace, &mut in_flight.task).await {
                Ok(joined) => {
                    let frame = self.terminal_frame(&in_flight, joined);
                    let _ = self.frames.try_send(frame);
                }
                Err(_) => {
                    warn!(job = %in_flight.job, "request cleanup exceeded grace period, aborting");
                    in_flight.task.abort();
                }
            }
        }
        self.handle.set_state(SessionState::Closed);
    }
}

/// Serve one upgraded socket until it ends. Holds `registration` for the
/// whole connection.
pub async fn handle_socket(
    socket: WebSocket,
    registration: Registration,
    pipeline: Arc<JobPipeline>,
    config: Arc<ServerConfig>,
) {
    let handle = Arc::clone(registration.handle());
    let span = info_span!("session", session_id = %handle.id());

    async move {
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!("session opened");

        let (ws_tx, ws_rx) = socket.split();
        let (frames_tx, frames_rx) = mpsc::channel(config.outbound_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);

        let mut writer = tokio::spawn(
            write_loop(ws_tx, frames_rx, config.heartbeat_interval).in_current_span(),
        );
        let reader = tokio::spawn(read_loop(ws_rx, inbound_tx).in_current_span());

        let mut orchestrator =
            SessionOrchestrator::new(Arc::clone(&handle), pipeline, Arc::clone(&config), frames_tx);
        match orchestrator.run(inbound_rx).await {
            Ok(()) => debug!("session loop ended"),
            Err(e) => warn!(error = %e, "session ended abnormally"),
        }
        orchestrator.close().await;
        drop(orchestrator);

        reader.abort();
        match tokio::time::timeout(config.shutdown_grace, &mut writer).await {
            Ok(Ok(Err(e))) => debug!(error = %e, "writer stopped"),
            Ok(_) => {}
            Err(_) => writer.abort(),
        }

        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        info!(age_secs = handle.age().as_secs(), "session closed");
        drop(registration);
    }
    .instrument(span)
    .await;
}
