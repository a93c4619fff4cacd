//! End-to-end tests over a real socket with stub job runners.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use lipsync_core::Frame;
use lipsync_engine::{
    BlockingJobRunner, JobError, JobExit, JobInvocation, JobPipeline, JobRunner, Offloaded,
    ProgressPublisher,
};
use lipsync_server::{ServerConfig, ServerHandle, ShutdownCoordinator};
use lipsync_settings::LipsyncSettings;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Skeleton of a 10x10 baseline JPEG: SOI, JFIF APP0, SOF0, EOI.
const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0\x01\x01\0\0\x01\0\x01\0\0\
\xFF\xC0\0\x0B\x08\0\x0A\0\x0A\x01\x01\x11\0\xFF\xD9";
const VIDEO: &[u8] = b"\0\0\0\x18ftypmp42 talking head";

/// One second of 16 kHz mono 16-bit PCM silence in a RIFF/WAVE container.
fn wav_one_second() -> Vec<u8> {
    const RATE: u32 = 16_000;
    let data_len = RATE * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&RATE.to_le_bytes());
    wav.extend_from_slice(&(RATE * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}

/// Writes the result after emitting progress, unless told to fail.
struct StubRunner {
    exit_code: i32,
    delay: Duration,
    calls: AtomicUsize,
    staged: Mutex<Vec<(PathBuf, u64)>>,
}

impl StubRunner {
    fn new(exit_code: i32) -> Arc<Self> {
        Self::slow(exit_code, Duration::ZERO)
    }

    fn slow(exit_code: i32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            delay,
            calls: AtomicUsize::new(0),
            staged: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRunner for StubRunner {
    async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        _cancel: CancellationToken,
    ) -> Result<JobExit, JobError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().push(staged_inputs(invocation));
        let _ = progress.publish("frame 1/2");
        tokio::time::sleep(self.delay).await;
        let _ = progress.publish("frame 2/2");
        if self.exit_code == 0 {
            write_result(&invocation.result_path);
        }
        Ok(JobExit::code(self.exit_code))
    }
}

/// Blocks until cancelled and records that it was.
#[derive(Default)]
struct UntilCancelled {
    started: AtomicBool,
    cancelled: AtomicBool,
}

#[async_trait]
impl JobRunner for UntilCancelled {
    async fn run(
        &self,
        _invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: CancellationToken,
    ) -> Result<JobExit, JobError> {
        self.started.store(true, Ordering::SeqCst);
        let _ = progress.publish("waiting");
        cancel.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Err(JobError::Cancelled)
    }
}

/// Same contract as [`StubRunner`], on the blocking pool.
struct BlockingStub;

impl BlockingJobRunner for BlockingStub {
    fn run_blocking(
        &self,
        invocation: &JobInvocation,
        progress: &ProgressPublisher,
        _cancel: &CancellationToken,
    ) -> Result<JobExit, JobError> {
        for step in 1..=3 {
            let _ = progress.publish(format!("blocking step {step}/3"));
            std::thread::sleep(Duration::from_millis(5));
        }
        write_result(&invocation.result_path);
        Ok(JobExit::code(0))
    }
}

/// Image path and audio size the job was pointed at by its descriptor.
fn staged_inputs(invocation: &JobInvocation) -> (PathBuf, u64) {
    let raw = std::fs::read(&invocation.artifact_path).unwrap();
    let document: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let entry = &document[invocation.job.as_str()];
    let image = PathBuf::from(entry["video_path"].as_str().unwrap());
    let audio = entry["audio_clips"]
        .as_object()
        .unwrap()
        .values()
        .next()
        .and_then(serde_json::Value::as_str)
        .unwrap();
    (image, std::fs::metadata(audio).unwrap().len())
}

/// The first job stays running until released; later jobs run on the
/// blocking pool. Every job-side progress line starts with the job name.
struct HeldThenBlocking {
    calls: AtomicUsize,
    held_running: AtomicBool,
    release: CancellationToken,
    blocking: Offloaded<TaggedBlocking>,
}

impl HeldThenBlocking {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            held_running: AtomicBool::new(false),
            release: CancellationToken::new(),
            blocking: Offloaded::new(TaggedBlocking),
        })
    }
}

#[async_trait]
impl JobRunner for HeldThenBlocking {
    async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: CancellationToken,
    ) -> Result<JobExit, JobError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return self.blocking.run(invocation, progress, cancel).await;
        }
        self.held_running.store(true, Ordering::SeqCst);
        let _ = progress.publish(format!("{} held step 1", invocation.job));
        tokio::select! {
            () = self.release.cancelled() => {}
            () = cancel.cancelled() => {
                self.held_running.store(false, Ordering::SeqCst);
                return Err(JobError::Cancelled);
            }
        }
        let _ = progress.publish(format!("{} held step 2", invocation.job));
        write_result(&invocation.result_path);
        self.held_running.store(false, Ordering::SeqCst);
        Ok(JobExit::code(0))
    }
}

/// Sleeps on its thread between progress lines.
struct TaggedBlocking;

impl BlockingJobRunner for TaggedBlocking {
    fn run_blocking(
        &self,
        invocation: &JobInvocation,
        progress: &ProgressPublisher,
        _cancel: &CancellationToken,
    ) -> Result<JobExit, JobError> {
        for step in 1..=3 {
            let _ = progress.publish(format!("{} blocking step {step}", invocation.job));
            std::thread::sleep(Duration::from_millis(50));
        }
        write_result(&invocation.result_path);
        Ok(JobExit::code(0))
    }
}

fn write_result(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, VIDEO).unwrap();
}

struct TestServer {
    _dir: TempDir,
    work_root: PathBuf,
    shutdown: ShutdownCoordinator,
    handle: ServerHandle,
}

impl TestServer {
    async fn start(runner: Arc<dyn JobRunner>) -> Self {
        Self::start_with(runner, |_| {}).await
    }

    async fn start_with(runner: Arc<dyn JobRunner>, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = LipsyncSettings::default();
        settings.staging.work_root = dir.path().join("work");
        settings.job.progress_poll_ms = 10;

        let mut config = ServerConfig::from_settings(&settings.server);
        config.host = "127.0.0.1".into();
        config.port = 0;
        config.shutdown_grace = Duration::from_secs(2);
        tweak(&mut config);

        let pipeline = Arc::new(JobPipeline::from_settings(&settings, runner));
        let shutdown = ShutdownCoordinator::new();
        let handle = lipsync_server::start(config, pipeline, shutdown.clone(), None)
            .await
            .unwrap();
        Self {
            work_root: settings.staging.work_root,
            _dir: dir,
            shutdown,
            handle,
        }
    }

    async fn connect(&self) -> Client {
        let url = format!("ws://{}/ws/lipsync", self.handle.addr());
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    /// Files left under the work root.
    fn leftovers(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.work_root) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn request() -> String {
    serde_json::json!({
        "image_base64": STANDARD.encode(JPEG),
        "audio_base64": STANDARD.encode(wav_one_second()),
    })
    .to_string()
}

async fn send(ws: &mut Client, text: String) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn next_frame(ws: &mut Client) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Frames up to and including the next terminal frame.
async fn until_terminal(ws: &mut Client) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        let done = frame.is_terminal();
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Job names found at the start of job-side progress lines.
fn job_tags(frames: &[Frame]) -> BTreeSet<String> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Processing { message } if message.contains(" step ") => {
                message.split_whitespace().next().map(str::to_owned)
            }
            _ => None,
        })
        .collect()
}

fn error_code(frame: &Frame) -> Option<&str> {
    match frame {
        Frame::Error { code, .. } => code.as_deref(),
        _ => None,
    }
}

#[tokio::test]
async fn success_returns_encoded_result_after_progress() {
    let runner = StubRunner::new(0);
    let server = TestServer::start(runner.clone()).await;
    let mut ws = server.connect().await;

    send(&mut ws, request()).await;
    let frames = until_terminal(&mut ws).await;

    let (terminal, progress) = frames.split_last().unwrap();
    assert_eq!(
        terminal,
        &Frame::Success {
            video_base64: STANDARD.encode(VIDEO)
        }
    );
    let messages: Vec<&str> = progress
        .iter()
        .map(|f| match f {
            Frame::Processing { message } => message.as_str(),
            other => panic!("unexpected frame before terminal: {other:?}"),
        })
        .collect();
    let first = messages.iter().position(|m| *m == "frame 1/2").unwrap();
    let second = messages.iter().position(|m| *m == "frame 2/2").unwrap();
    assert!(first < second);
    assert_eq!(messages.first(), Some(&"Staging inputs"));
    assert_eq!(runner.calls(), 1);

    let staged = runner.staged.lock();
    let (image, audio_bytes) = &staged[0];
    assert_eq!(image.file_name().unwrap(), "image.jpg");
    assert_eq!(*audio_bytes, 44 + 32_000);
}

#[tokio::test]
async fn nonzero_exit_reports_exit_code() {
    let server = TestServer::start(StubRunner::new(1)).await;
    let mut ws = server.connect().await;

    send(&mut ws, request()).await;
    let terminal = until_terminal(&mut ws).await.pop().unwrap();
    match terminal {
        Frame::Error { error, code } => {
            assert_eq!(code.as_deref(), Some("job_execution_error"));
            assert!(error.contains('1'), "{error}");
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_audio_is_rejected_without_running() {
    let runner = StubRunner::new(0);
    let server = TestServer::start(runner.clone()).await;
    let mut ws = server.connect().await;

    let body = serde_json::json!({ "image_base64": STANDARD.encode(JPEG) }).to_string();
    send(&mut ws, body).await;
    let frames = until_terminal(&mut ws).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(error_code(&frames[0]), Some("validation_error"));
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn invalid_json_keeps_session_open() {
    let server = TestServer::start(StubRunner::new(0)).await;
    let mut ws = server.connect().await;

    send(&mut ws, "not json".into()).await;
    assert_eq!(error_code(&next_frame(&mut ws).await), Some("validation_error"));

    send(&mut ws, request()).await;
    let terminal = until_terminal(&mut ws).await.pop().unwrap();
    assert!(matches!(terminal, Frame::Success { .. }));
}

#[tokio::test]
async fn sequential_requests_share_a_connection_and_clean_up() {
    let runner = StubRunner::new(0);
    let server = TestServer::start(runner.clone()).await;
    let mut ws = server.connect().await;

    for _ in 0..2 {
        send(&mut ws, request()).await;
        let terminal = until_terminal(&mut ws).await.pop().unwrap();
        assert!(matches!(terminal, Frame::Success { .. }));
    }
    assert_eq!(runner.calls(), 2);
    assert!(server.leftovers().is_empty(), "{:?}", server.leftovers());
}

#[tokio::test]
async fn blocking_runner_is_offloaded() {
    let server = TestServer::start(Arc::new(Offloaded::new(BlockingStub))).await;
    let mut ws = server.connect().await;

    send(&mut ws, request()).await;
    let frames = until_terminal(&mut ws).await;
    let steps = frames
        .iter()
        .filter(|f| matches!(f, Frame::Processing { message } if message.starts_with("blocking step")))
        .count();
    assert_eq!(steps, 3);
    assert!(matches!(frames.last(), Some(Frame::Success { .. })));
}

#[tokio::test]
async fn requests_queue_behind_the_running_one() {
    let runner = StubRunner::slow(0, Duration::from_millis(300));
    let server = TestServer::start_with(runner.clone(), |c| c.max_queued_requests = 1).await;
    let mut ws = server.connect().await;

    for _ in 0..3 {
        send(&mut ws, request()).await;
    }

    let mut successes = 0;
    let mut busy = 0;
    while successes + busy < 3 {
        let frame = next_frame(&mut ws).await;
        match error_code(&frame) {
            Some("busy") => busy += 1,
            Some(other) => panic!("unexpected error {other}"),
            None if frame.is_terminal() => successes += 1,
            None => {}
        }
    }
    assert_eq!((successes, busy), (2, 1));
    assert_eq!(runner.calls(), 2);
}

#[tokio::test]
async fn long_job_does_not_stall_other_sessions() {
    let runner = HeldThenBlocking::new();
    let server = TestServer::start(runner.clone()).await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    send(&mut first, request()).await;
    let mut first_frames = Vec::new();
    while !matches!(
        first_frames.last(),
        Some(Frame::Processing { message }) if message.ends_with("held step 1")
    ) {
        first_frames.push(next_frame(&mut first).await);
    }

    send(&mut second, request()).await;
    let second_frames = until_terminal(&mut second).await;
    assert!(matches!(second_frames.last(), Some(Frame::Success { .. })), "{second_frames:?}");
    assert!(runner.held_running.load(Ordering::SeqCst), "first job ended early");
    assert!(server.handle.registry().active_jobs() >= 1);

    runner.release.cancel();
    first_frames.extend(until_terminal(&mut first).await);
    assert!(matches!(first_frames.last(), Some(Frame::Success { .. })), "{first_frames:?}");

    let (first_jobs, second_jobs) = (job_tags(&first_frames), job_tags(&second_frames));
    assert_eq!(first_jobs.len(), 1, "{first_frames:?}");
    assert_eq!(second_jobs.len(), 1, "{second_frames:?}");
    assert!(first_jobs.is_disjoint(&second_jobs));

    let blocking_steps = |frames: &[Frame]| {
        frames
            .iter()
            .filter(|f| matches!(f, Frame::Processing { message } if message.contains("blocking step")))
            .count()
    };
    assert_eq!(blocking_steps(&second_frames), 3);
    assert_eq!(blocking_steps(&first_frames), 0);
}

#[tokio::test]
async fn disconnect_cancels_running_job() {
    let runner = Arc::new(UntilCancelled::default());
    let server = TestServer::start(runner.clone()).await;
    let mut ws = server.connect().await;

    send(&mut ws, request()).await;
    loop {
        if let Frame::Processing { message } = next_frame(&mut ws).await {
            if message == "waiting" {
                break;
            }
        }
    }
    assert!(runner.started.load(Ordering::SeqCst));
    drop(ws);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !runner.cancelled.load(Ordering::SeqCst) || server.handle.registry().count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job was not cancelled");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.leftovers().is_empty(), "{:?}", server.leftovers());
}

#[tokio::test]
async fn connections_over_the_cap_get_503() {
    let server = TestServer::start_with(StubRunner::new(0), |c| c.max_connections = 1).await;
    let _first = server.connect().await;

    let url = format!("ws://{}/ws", server.handle.addr());
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 503);
        }
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn health_counts_open_sessions() {
    let server = TestServer::start(StubRunner::new(0)).await;
    let _ws = server.connect().await;

    let mut stream = TcpStream::connect(server.handle.addr()).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    let _ = stream.read_to_string(&mut raw).await.unwrap();

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    let body = raw.split("\r\n\r\n").nth(1).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["connections"], 1);
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let server = TestServer::start(StubRunner::new(0)).await;
    let mut ws = server.connect().await;

    server.shutdown.shutdown();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "session stayed open after shutdown");
}
