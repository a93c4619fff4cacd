//! Job descriptors and the file-backed control artifact the job reads them
//! from.
//!
//! The artifact is a JSON object keyed by job name. JSON is a subset of YAML
//! 1.2, so runners that load their inference config as YAML read it as-is.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lipsync_core::JobId;
use lipsync_settings::{ArtifactMode, LipsyncSettings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::staging::StagedInputs;

/// Everything needed to launch one job and locate its result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Unique job name.
    pub job: JobId,
    /// Profile/version tag.
    pub version: String,
    /// Source portrait.
    pub video_path: PathBuf,
    /// Clip name -> audio path. Always exactly one entry.
    pub audio_clips: BTreeMap<String, PathBuf>,
    /// `<work_root>/<job>`.
    pub job_dir: PathBuf,
    /// Frame output directory.
    pub output_dir: PathBuf,
    /// Scratch directory.
    pub tmp_dir: PathBuf,
    /// Passed as `--result_dir`.
    pub result_dir: PathBuf,
    /// Where the job writes rendered clips.
    pub vid_output_dir: PathBuf,
    /// The file the job must produce.
    pub result_path: PathBuf,
    /// Ask the job to (re)build its avatar before rendering.
    pub preparation: bool,
    /// Target frame rate.
    pub fps: u32,
    /// Inference batch size.
    pub batch_size: u32,
    /// Face bounding box shift.
    pub bbox_shift: i32,
}

impl JobDescriptor {
    /// Create the directories the job writes into.
    pub async fn prepare_directories(&self) -> Result<(), DescriptorError> {
        for dir in [&self.output_dir, &self.tmp_dir, &self.result_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| DescriptorError::Write {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn entry(&self) -> ArtifactEntry {
        ArtifactEntry {
            video_path: self.video_path.clone(),
            audio_clips: self.audio_clips.clone(),
            output_dir: self.output_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            vid_output_dir: self.vid_output_dir.clone(),
            preparation: self.preparation,
            bbox_shift: self.bbox_shift,
        }
    }
}

/// One job's entry in the control artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Source portrait.
    pub video_path: PathBuf,
    /// Clip name -> audio path.
    pub audio_clips: BTreeMap<String, PathBuf>,
    /// Frame output directory.
    pub output_dir: PathBuf,
    /// Scratch directory.
    pub tmp_dir: PathBuf,
    /// Rendered clip directory.
    pub vid_output_dir: PathBuf,
    /// Rebuild the avatar first.
    pub preparation: bool,
    /// Face bounding box shift.
    pub bbox_shift: i32,
}

/// Computes descriptor paths from the configured layout.
#[derive(Clone, Debug)]
pub struct DescriptorBuilder {
    work_root: PathBuf,
    version: String,
    clip_name: String,
    fps: u32,
    batch_size: u32,
    bbox_shift: i32,
}

impl DescriptorBuilder {
    /// Builder rooted at `work_root` with default job parameters.
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        let job = lipsync_settings::JobSettings::default();
        Self {
            work_root: work_root.into(),
            version: job.version,
            clip_name: job.clip_name,
            fps: job.fps,
            batch_size: job.batch_size,
            bbox_shift: job.bbox_shift,
        }
    }

    /// Builder from the `staging` and `job` settings sections.
    pub fn from_settings(settings: &LipsyncSettings) -> Self {
        Self {
            work_root: settings.staging.work_root.clone(),
            version: settings.job.version.clone(),
            clip_name: settings.job.clip_name.clone(),
            fps: settings.job.fps,
            batch_size: settings.job.batch_size,
            bbox_shift: settings.job.bbox_shift,
        }
    }

    /// Override the version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Override the clip name.
    #[must_use]
    pub fn with_clip_name(mut self, clip_name: impl Into<String>) -> Self {
        self.clip_name = clip_name.into();
        self
    }

    /// Deterministic: the same inputs and job name yield the same descriptor.
    pub fn build(&self, staged: &StagedInputs, job: &JobId) -> JobDescriptor {
        let job_dir = self.work_root.join(job.as_str());
        let result_dir = job_dir.join("results");
        let vid_output_dir = result_dir
            .join(&self.version)
            .join("avatars")
            .join(job.as_str())
            .join("vid_output");
        let result_path = vid_output_dir.join(format!("{}.mp4", self.clip_name));
        let mut audio_clips = BTreeMap::new();
        let _ = audio_clips.insert(self.clip_name.clone(), staged.audio_path().to_path_buf());

        JobDescriptor {
            job: job.clone(),
            version: self.version.clone(),
            video_path: staged.image_path().to_path_buf(),
            audio_clips,
            output_dir: job_dir.join("output"),
            tmp_dir: job_dir.join("tmp"),
            result_dir,
            vid_output_dir,
            result_path,
            job_dir,
            preparation: true,
            fps: self.fps,
            batch_size: self.batch_size,
            bbox_shift: self.bbox_shift,
        }
    }
}

/// Control artifact failures.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// Existing artifact could not be read.
    #[error("failed to read control artifact {path}: {source}")]
    Read {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Artifact or job directory could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Existing artifact is not a JSON object.
    #[error("control artifact {path} is malformed: {reason}")]
    Malformed {
        /// Artifact path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Entry could not be encoded.
    #[error("failed to encode descriptor: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
enum Location {
    PerJob { root: PathBuf },
    Shared { path: PathBuf },
}

/// Reads and writes the control artifact.
///
/// Every read-modify-write happens under one async mutex. In shared mode the
/// guard is handed to the caller inside [`CommittedDescriptor`] and held until
/// [`ArtifactStore::retract`], so at most one job owns the shared artifact.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    location: Location,
    lock: Arc<Mutex<()>>,
}

/// Proof that a descriptor is in the artifact. Hand it back to
/// [`ArtifactStore::retract`].
#[derive(Debug)]
pub struct CommittedDescriptor {
    job: JobId,
    artifact_path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CommittedDescriptor {
    /// Artifact file the job should read.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Job the entry belongs to.
    pub fn job(&self) -> &JobId {
        &self.job
    }

    /// Whether this commit holds the shared-artifact lock.
    pub fn holds_lock(&self) -> bool {
        self.guard.is_some()
    }
}

impl ArtifactStore {
    /// One `<root>/<job>.json` per job.
    pub fn per_job(root: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::PerJob { root: root.into() },
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// A single artifact at `path`, serialized process-wide.
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::Shared { path: path.into() },
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store matching the `job.artifact` settings. Shared mode without a path
    /// falls back to `<work_root>/control.json`.
    pub fn from_settings(settings: &LipsyncSettings) -> Self {
        let root = &settings.staging.work_root;
        match settings.job.artifact.mode {
            ArtifactMode::PerJob => Self::per_job(root),
            ArtifactMode::Shared => Self::shared(
                settings
                    .job
                    .artifact
                    .shared_path
                    .clone()
                    .unwrap_or_else(|| root.join("control.json")),
            ),
        }
    }

    /// Artifact path for `job`.
    pub fn artifact_path(&self, job: &JobId) -> PathBuf {
        match &self.location {
            Location::PerJob { root } => root.join(format!("{job}.json")),
            Location::Shared { path } => path.clone(),
        }
    }

    fn is_shared(&self) -> bool {
        matches!(self.location, Location::Shared { .. })
    }

    /// Add `descriptor` to the artifact. Waits for the shared lock if another
    /// job holds it.
    pub async fn commit(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<CommittedDescriptor, DescriptorError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let path = self.artifact_path(&descriptor.job);

        let mut document = read_document(&path).await?;
        let _ = document.insert(
            descriptor.job.to_string(),
            serde_json::to_value(descriptor.entry())?,
        );
        write_document(&path, &document, &descriptor.job).await?;
        debug!(job = %descriptor.job, artifact = %path.display(), "descriptor committed");

        Ok(CommittedDescriptor {
            job: descriptor.job.clone(),
            artifact_path: path,
            guard: self.is_shared().then_some(guard),
        })
    }

    /// Undo a commit and release the shared lock.
    pub async fn retract(&self, committed: CommittedDescriptor) -> Result<(), DescriptorError> {
        let CommittedDescriptor {
            job,
            artifact_path,
            guard,
        } = committed;
        let _guard = match guard {
            Some(guard) => guard,
            None => Arc::clone(&self.lock).lock_owned().await,
        };

        if self.is_shared() {
            let mut document = read_document(&artifact_path).await?;
            if document.remove(job.as_str()).is_some() {
                write_document(&artifact_path, &document, &job).await?;
            }
        } else {
            match tokio::fs::remove_file(&artifact_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(DescriptorError::Write {
                        path: artifact_path,
                        source,
                    });
                }
            }
        }
        debug!(job = %job, "descriptor retracted");
        Ok(())
    }

    /// Entry for `job` as currently stored.
    pub async fn lookup(&self, job: &JobId) -> Result<Option<ArtifactEntry>, DescriptorError> {
        let path = self.artifact_path(job);
        let document = read_document(&path).await?;
        document
            .get(job.as_str())
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(DescriptorError::from)
    }
}

async fn read_document(path: &Path) -> Result<Map<String, Value>, DescriptorError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => {
            return Err(DescriptorError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DescriptorError::Malformed {
            path: path.to_path_buf(),
            reason: format!("expected an object, found {}", value_kind(&other)),
        }),
        Err(e) => Err(DescriptorError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn write_document(
    path: &Path,
    document: &Map<String, Value>,
    job: &JobId,
) -> Result<(), DescriptorError> {
    let write_err = |path: &Path, source| DescriptorError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_err(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map_or_else(|| "control".into(), |n| n.to_string_lossy());
    let tmp = path.with_file_name(format!(".{file_name}.{job}.tmp"));
    let bytes = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| write_err(tmp.as_path(), e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp artifact");
        }
        return Err(write_err(path, e));
    }
    Ok(())
}
