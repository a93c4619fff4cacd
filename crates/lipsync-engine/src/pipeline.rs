//! One request, end to end: stage, normalize, describe, run, finalize,
//! clean up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lipsync_core::{Frame, JobId, RequestPayloads};
use lipsync_settings::LipsyncSettings;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::{ArtifactStore, DescriptorBuilder};
use crate::error::EngineError;
use crate::preprocess::{PassthroughPreprocessor, Preprocessor};
use crate::progress::{self, ProgressPublisher};
use crate::runner::{JobInvocation, JobRunner, JobRunnerAdapter, ResultHandle};
use crate::staging::{ResourceStaging, StagedInputs};

/// Completed jobs by outcome code (`success` or an error code).
pub const JOBS_TOTAL: &str = "lipsync_jobs_total";
/// Wall time from staging to cleanup.
pub const JOB_DURATION_SECONDS: &str = "lipsync_job_duration_seconds";
/// Progress frames handed to sessions.
pub const PROGRESS_FRAMES_TOTAL: &str = "lipsync_progress_frames_total";

/// Where a request currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    /// Writing inputs to disk.
    Staging,
    /// Building and committing the descriptor.
    Submitting,
    /// External job running.
    Running,
    /// Reading and publishing the result.
    Finalizing,
}

/// Told about every stage transition.
pub trait StageObserver: Send + Sync {
    /// `job` entered `stage`.
    fn stage_changed(&self, job: &JobId, stage: PipelineStage);
}

impl StageObserver for () {
    fn stage_changed(&self, _job: &JobId, _stage: PipelineStage) {}
}

/// A successful request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOutput {
    /// Result file contents.
    pub video: Vec<u8>,
    /// Copy in the publish directory, when one is configured.
    pub published_path: Option<PathBuf>,
}

/// Knobs not owned by a sub-component.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Progress drain wake-up interval.
    pub poll_interval: Duration,
    /// Keep `<work_root>/<job>` after the request.
    pub keep_intermediates: bool,
    /// Copy results to `<publish_dir>/<job>.mp4`.
    pub publish_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            keep_intermediates: false,
            publish_dir: None,
        }
    }
}

/// Runs requests. Shared by every session.
pub struct JobPipeline {
    staging: ResourceStaging,
    preprocessor: Arc<dyn Preprocessor>,
    builder: DescriptorBuilder,
    store: ArtifactStore,
    adapter: JobRunnerAdapter,
    config: PipelineConfig,
}

impl std::fmt::Debug for JobPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPipeline")
            .field("staging", &self.staging)
            .field("store", &self.store)
            .field("adapter", &self.adapter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobPipeline {
    /// Pipeline built from settings around `runner`.
    pub fn from_settings(settings: &LipsyncSettings, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            staging: ResourceStaging::new(&settings.staging.work_root),
            preprocessor: Arc::new(PassthroughPreprocessor),
            builder: DescriptorBuilder::from_settings(settings),
            store: ArtifactStore::from_settings(settings),
            adapter: JobRunnerAdapter::new(runner, Duration::from_secs(settings.job.timeout_secs)),
            config: PipelineConfig {
                poll_interval: Duration::from_millis(settings.job.progress_poll_ms),
                keep_intermediates: settings.staging.keep_intermediates,
                publish_dir: settings.staging.publish_dir.clone(),
            },
        }
    }

    /// Replace the preprocessor.
    #[must_use]
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Staging area, for inspection.
    pub fn staging(&self) -> &ResourceStaging {
        &self.staging
    }

    /// Run one request. Progress frames go to `sink` and have all been sent
    /// by the time this returns; the terminal frame is the caller's.
    #[instrument(skip_all, fields(job = %job))]
    pub async fn execute(
        &self,
        job: JobId,
        payloads: RequestPayloads,
        sink: mpsc::Sender<Frame>,
        cancel: CancellationToken,
        observer: &dyn StageObserver,
    ) -> Result<PipelineOutput, EngineError> {
        let started = Instant::now();
        let (publisher, drain) = progress::channel(self.config.poll_interval);
        let drain_task = tokio::spawn(drain.drain_loop(sink, cancel.child_token()));

        let outcome = self
            .run_stages(&job, &payloads, &publisher, &cancel, observer)
            .await;
        drop(publisher);

        if !self.config.keep_intermediates {
            if let Err(e) = self.staging.release_scope(&job).await {
                warn!(error = %e, "failed to remove job directory");
            }
        }

        // Ends once every publisher is dropped and the queue is empty, or when
        // the session cancels or stops reading.
        match drain_task.await {
            Ok(report) => {
                debug!(forwarded = report.forwarded, outcome = ?report.outcome, "progress drained");
                counter!(PROGRESS_FRAMES_TOTAL).increment(report.forwarded);
            }
            Err(e) => warn!(error = %e, "progress drain failed"),
        }

        let label = match &outcome {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        counter!(JOBS_TOTAL, "outcome" => label).increment(1);
        histogram!(JOB_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(outcome = label, elapsed_ms = started.elapsed().as_millis() as u64, "request finished");
        outcome
    }

    async fn run_stages(
        &self,
        job: &JobId,
        payloads: &RequestPayloads,
        publisher: &ProgressPublisher,
        cancel: &CancellationToken,
        observer: &dyn StageObserver,
    ) -> Result<PipelineOutput, EngineError> {
        observer.stage_changed(job, PipelineStage::Staging);
        let _ = publisher.publish("Staging inputs");
        let staged = self.staging.stage_inputs(job, payloads).await?;

        let outcome = self
            .submit(job, &staged, publisher, cancel, observer)
            .await;
        if let Err(e) = staged.release().await {
            warn!(error = %e, "failed to release staged inputs");
        }
        outcome
    }

    async fn submit(
        &self,
        job: &JobId,
        staged: &StagedInputs,
        publisher: &ProgressPublisher,
        cancel: &CancellationToken,
        observer: &dyn StageObserver,
    ) -> Result<PipelineOutput, EngineError> {
        self.preprocessor.normalize(staged).await?;

        observer.stage_changed(job, PipelineStage::Submitting);
        let descriptor = self.builder.build(staged, job);
        descriptor.prepare_directories().await?;
        let committed = self.store.commit(&descriptor).await?;
        let _ = publisher.publish("Job submitted");

        observer.stage_changed(job, PipelineStage::Running);
        let invocation = JobInvocation::new(&descriptor, &committed);
        let outcome = match self.adapter.run(&invocation, publisher.clone(), cancel).await {
            Ok(handle) => {
                observer.stage_changed(job, PipelineStage::Finalizing);
                let _ = publisher.publish("Encoding result");
                self.finalize(job, &handle).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.store.retract(committed).await {
            warn!(error = %e, "failed to retract descriptor");
        }
        outcome
    }

    async fn finalize(
        &self,
        job: &JobId,
        handle: &ResultHandle,
    ) -> Result<PipelineOutput, EngineError> {
        let video = tokio::fs::read(&handle.path)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to read result: {e}")))?;

        let published_path = match &self.config.publish_dir {
            Some(dir) => {
                let target = dir.join(format!("{job}.mp4"));
                let copied = async {
                    tokio::fs::create_dir_all(dir).await?;
                    tokio::fs::write(&target, &video).await
                }
                .await;
                match copied {
                    Ok(()) => Some(target),
                    Err(e) => {
                        warn!(target = %target.display(), error = %e, "failed to publish result");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(PipelineOutput {
            video,
            published_path,
        })
    }
}
