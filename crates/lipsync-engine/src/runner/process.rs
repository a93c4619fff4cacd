//! Runs the job as a child process.

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lipsync_settings::JobSettings;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{JobError, JobExit, JobInvocation, JobRunner};
use crate::progress::ProgressPublisher;

/// How long to wait for output pipes to close after the process exits.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for output pipes after killing leftover descendants.
const REAP_GRACE: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;
const READ_CHUNK: usize = 4096;

/// Spawns `<program> <args...> --version <tag> --inference_config <artifact>
/// --result_dir <dir> --fps <n> --batch_size <n>`.
///
/// Stdout lines become progress messages. A yes/no prompt on stdout is
/// answered with `y` once. The child leads its own process group, and the
/// whole group is killed on cancellation, when the run future is dropped, and
/// when descendants keep the output pipes open after the child exits.
#[derive(Clone, Debug)]
pub struct ProcessJobRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ProcessJobRunner {
    /// Runner for `program` with no leading arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Runner configured from the `job` settings section.
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
            env: settings.env.clone(),
        }
    }

    /// Arguments placed before the generated flags.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Working directory of the child.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Extra environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Full argument list for `invocation`, excluding the program.
    pub fn command_args(&self, invocation: &JobInvocation) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.extend([
            "--version".into(),
            invocation.version.clone().into(),
            "--inference_config".into(),
            invocation.artifact_path.clone().into_os_string(),
            "--result_dir".into(),
            invocation.result_dir.clone().into_os_string(),
            "--fps".into(),
            invocation.fps.to_string().into(),
            "--batch_size".into(),
            invocation.batch_size.to_string().into(),
        ]);
        args
    }

    fn command(&self, invocation: &JobInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        let _ = cmd
            .args(self.command_args(invocation))
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.env)
            .env("LIPSYNC_JOB_NAME", invocation.job.as_str())
            .env("LIPSYNC_RESULT_PATH", &invocation.result_path)
            .env("LIPSYNC_CONTROL_ARTIFACT", &invocation.artifact_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        let _ = cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            let _ = cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl JobRunner for ProcessJobRunner {
    #[instrument(skip_all, fields(job = %invocation.job, program = %self.program))]
    async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: CancellationToken,
    ) -> Result<JobExit, JobError> {
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|source| JobError::Launch {
                program: self.program.clone(),
                source,
            })?;
        info!(pid = child.id(), "job started");

        let mut group = GroupKill::of(&child);

        let stdin = child.stdin.take();
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(relay_stdout(stdout, stdin, progress)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES)));
        let readers: Vec<AbortHandle> = stdout_task
            .as_ref()
            .map(JoinHandle::abort_handle)
            .into_iter()
            .chain(stderr_task.as_ref().map(JoinHandle::abort_handle))
            .collect();
        let abort_readers = || readers.iter().for_each(AbortHandle::abort);

        let status = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status,
                Err(e) => {
                    group.kill();
                    abort_readers();
                    return Err(JobError::Worker(format!("failed to wait for job: {e}")));
                }
            },
            () = cancel.cancelled() => {
                warn!("killing cancelled job");
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill job");
                }
                abort_readers();
                return Err(JobError::Cancelled);
            }
        };

        // Descendants may still hold the pipes after the leader exits.
        let mut outputs = std::pin::pin!(async move {
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            }
        });
        let stderr_tail = match tokio::time::timeout(OUTPUT_GRACE, outputs.as_mut()).await {
            Ok(tail) => {
                group.release();
                tail
            }
            Err(_) => {
                debug!("output still open after exit, killing process group");
                group.kill();
                match tokio::time::timeout(REAP_GRACE, outputs.as_mut()).await {
                    Ok(tail) => tail,
                    Err(_) => {
                        abort_readers();
                        Vec::new()
                    }
                }
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        info!(exit_code, "job exited");
        Ok(JobExit {
            exit_code,
            stderr_tail,
        })
    }
}

/// Kills the child's process group when dropped, unless released.
#[derive(Debug)]
struct GroupKill {
    leader: Option<u32>,
}

impl GroupKill {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    /// The group is empty; forget it.
    fn release(&mut self) {
        self.leader = None;
    }

    fn kill(&mut self) {
        if let Some(leader) = self.leader.take() {
            kill_group(leader);
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(leader: u32) {
    use rustix::io::Errno;
    use rustix::process::{Pid, Signal, kill_process_group};

    let Some(pid) = i32::try_from(leader).ok().and_then(Pid::from_raw) else {
        return;
    };
    match kill_process_group(pid, Signal::KILL) {
        Ok(()) => debug!(pgid = leader, "killed process group"),
        Err(Errno::SRCH) => {}
        Err(e) => warn!(pgid = leader, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: u32) {}

/// Splits a byte stream into trimmed, non-empty lines on `\n` or `\r`.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                lines.extend(self.take_line());
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Text received since the last line break.
    fn pending(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.pending)
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

fn is_confirmation_prompt(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ["(y/n)", "[y/n]", "y/n?", "(yes/no)", "[yes/no]"]
        .iter()
        .any(|marker| lower.contains(marker))
}

async fn answer_prompt(stdin: &mut Option<ChildStdin>) {
    let Some(mut pipe) = stdin.take() else {
        return;
    };
    debug!("answering confirmation prompt");
    if let Err(e) = pipe.write_all(b"y\n").await {
        warn!(error = %e, "failed to answer confirmation prompt");
        return;
    }
    if let Err(e) = pipe.flush().await {
        warn!(error = %e, "failed to flush confirmation answer");
    }
}

async fn relay_stdout(
    mut stdout: ChildStdout,
    mut stdin: Option<ChildStdin>,
    progress: ProgressPublisher,
) {
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "stdout read failed");
                break;
            }
        };
        for line in splitter.push(&buf[..n]) {
            if stdin.is_some() && is_confirmation_prompt(&line) {
                answer_prompt(&mut stdin).await;
            }
            let _ = progress.publish(line);
        }
        if stdin.is_some() && is_confirmation_prompt(&splitter.pending()) {
            if let Some(prompt) = splitter.take_line() {
                let _ = progress.publish(prompt);
            }
            answer_prompt(&mut stdin).await;
        }
    }
    if let Some(line) = splitter.take_line() {
        let _ = progress.publish(line);
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<String> {
    let mut splitter = LineSplitter::default();
    let mut tail = VecDeque::with_capacity(cap);
    let mut buf = vec![0u8; READ_CHUNK];
    let keep = |line: String, tail: &mut VecDeque<String>| {
        debug!(stderr = %line, "job output");
        if tail.len() == cap {
            let _ = tail.pop_front();
        }
        tail.push_back(line);
    };
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    keep(line, &mut tail);
                }
            }
        }
    }
    if let Some(line) = splitter.take_line() {
        keep(line, &mut tail);
    }
    tail.into()
}
