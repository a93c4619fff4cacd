//! The external generation job, behind a narrow trait.
//!
//! A [`JobRunner`] only launches the job and reports its exit code.
//! [`JobRunnerAdapter`] layers the time limit and result checks on top, so
//! every runner gets the same success criteria: exit code 0 and the declared
//! result file on disk.

mod process;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lipsync_core::JobId;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::descriptor::{CommittedDescriptor, JobDescriptor};
use crate::progress::ProgressPublisher;

pub use process::ProcessJobRunner;

/// How long a timed-out or cancelled runner gets to wind down.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Arguments for one job launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInvocation {
    /// Job name.
    pub job: JobId,
    /// Control artifact holding the job's descriptor.
    pub artifact_path: PathBuf,
    /// Passed as `--result_dir`.
    pub result_dir: PathBuf,
    /// File the job must produce.
    pub result_path: PathBuf,
    /// Passed as `--version`.
    pub version: String,
    /// Passed as `--fps`.
    pub fps: u32,
    /// Passed as `--batch_size`.
    pub batch_size: u32,
}

impl JobInvocation {
    /// Invocation for a committed descriptor.
    pub fn new(descriptor: &JobDescriptor, committed: &CommittedDescriptor) -> Self {
        Self {
            job: descriptor.job.clone(),
            artifact_path: committed.artifact_path().to_path_buf(),
            result_dir: descriptor.result_dir.clone(),
            result_path: descriptor.result_path.clone(),
            version: descriptor.version.clone(),
            fps: descriptor.fps,
            batch_size: descriptor.batch_size,
        }
    }
}

/// How a job process ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobExit {
    /// Exit code; `-1` when killed by a signal.
    pub exit_code: i32,
    /// Last lines of diagnostic output.
    pub stderr_tail: Vec<String>,
}

impl JobExit {
    /// Exit with `code` and no diagnostics.
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            stderr_tail: Vec::new(),
        }
    }
}

/// Job failures.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The process could not be started.
    #[error("failed to launch job runner `{program}`: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Non-zero exit.
    #[error("job failed with exit code {exit_code}")]
    Execution {
        /// Reported exit code.
        exit_code: i32,
    },

    /// Exit 0 without the declared result.
    #[error("job finished but produced no result at {path}")]
    ResultMissing {
        /// Expected result path.
        path: PathBuf,
    },

    /// Exceeded the configured maximum duration.
    #[error("job timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Cancelled by disconnect or shutdown.
    #[error("job cancelled")]
    Cancelled,

    /// The runner task itself failed.
    #[error("job worker failed: {0}")]
    Worker(String),
}

impl JobError {
    /// Frame `code` for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "job_launch_error",
            Self::Execution { .. } => "job_execution_error",
            Self::ResultMissing { .. } => "job_result_missing",
            Self::Timeout(_) => "job_timeout",
            Self::Cancelled => "job_cancelled",
            Self::Worker(_) => "internal_error",
        }
    }
}

/// Launches one job and waits for it.
///
/// Implementations publish progress as they see fit and must stop the job
/// promptly once `cancel` fires.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job to completion.
    async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: CancellationToken,
    ) -> Result<JobExit, JobError>;
}

/// A runner that blocks its thread. Wrap it in [`Offloaded`] to use it as a
/// [`JobRunner`].
pub trait BlockingJobRunner: Send + Sync + 'static {
    /// Run the job to completion on the current thread.
    fn run_blocking(
        &self,
        invocation: &JobInvocation,
        progress: &ProgressPublisher,
        cancel: &CancellationToken,
    ) -> Result<JobExit, JobError>;
}

/// Runs a [`BlockingJobRunner`] on the blocking thread pool.
#[derive(Debug)]
pub struct Offloaded<R> {
    inner: Arc<R>,
}

impl<R: BlockingJobRunner> Offloaded<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<R: BlockingJobRunner> JobRunner for Offloaded<R> {
    async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: CancellationToken,
    ) -> Result<JobExit, JobError> {
        let inner = Arc::clone(&self.inner);
        let invocation = invocation.clone();
        tokio::task::spawn_blocking(move || inner.run_blocking(&invocation, &progress, &cancel))
            .await
            .map_err(|e| JobError::Worker(e.to_string()))?
    }
}

/// A job that met every success criterion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultHandle {
    /// Verified result file.
    pub path: PathBuf,
}

/// Applies the time limit and result checks to any [`JobRunner`].
#[derive(Clone)]
pub struct JobRunnerAdapter {
    runner: Arc<dyn JobRunner>,
    timeout: Duration,
}

impl std::fmt::Debug for JobRunnerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunnerAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl JobRunnerAdapter {
    /// Adapter enforcing `timeout`.
    pub fn new(runner: Arc<dyn JobRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Configured maximum job duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the job and validate its outcome.
    pub async fn run(
        &self,
        invocation: &JobInvocation,
        progress: ProgressPublisher,
        cancel: &CancellationToken,
    ) -> Result<ResultHandle, JobError> {
        let job_cancel = cancel.child_token();
        let run = self.runner.run(invocation, progress, job_cancel.clone());
        tokio::pin!(run);

        let exit = tokio::select! {
            result = &mut run => result?,
            () = tokio::time::sleep(self.timeout) => {
                warn!(job = %invocation.job, timeout_secs = self.timeout.as_secs(), "job timed out");
                job_cancel.cancel();
                if tokio::time::timeout(KILL_GRACE, &mut run).await.is_err() {
                    warn!(job = %invocation.job, "runner did not stop after timeout");
                }
                return Err(JobError::Timeout(self.timeout));
            }
        };

        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if exit.exit_code != 0 {
            for line in &exit.stderr_tail {
                warn!(job = %invocation.job, stderr = %line, "job diagnostics");
            }
            return Err(JobError::Execution {
                exit_code: exit.exit_code,
            });
        }
        match tokio::fs::metadata(&invocation.result_path).await {
            Ok(meta) if meta.is_file() => {
                info!(job = %invocation.job, result = %invocation.result_path.display(), "job succeeded");
                Ok(ResultHandle {
                    path: invocation.result_path.clone(),
                })
            }
            _ => Err(JobError::ResultMissing {
                path: invocation.result_path.clone(),
            }),
        }
    }
}
