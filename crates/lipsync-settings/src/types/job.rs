//! External job runner settings.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How job descriptors are handed to the runner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactMode {
    /// One control artifact per job, named after the job.
    #[default]
    PerJob,
    /// A single shared artifact; submissions are serialized process-wide.
    Shared,
}

/// Control artifact settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactSettings {
    /// Per-job or shared.
    pub mode: ArtifactMode,
    /// Path of the shared artifact (shared mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_path: Option<PathBuf>,
}

/// How to launch the external generation job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSettings {
    /// Executable to launch.
    pub program: String,
    /// Arguments placed before the generated flags.
    pub args: Vec<String>,
    /// Working directory of the job (inherits ours when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the job.
    pub env: BTreeMap<String, String>,
    /// Profile/version tag passed as `--version`.
    pub version: String,
    /// Target frame rate.
    pub fps: u32,
    /// Inference batch size.
    pub batch_size: u32,
    /// Face bounding box shift written into the descriptor.
    pub bbox_shift: i32,
    /// Name of the single audio clip; the result file is `<clipName>.mp4`.
    pub clip_name: String,
    /// Maximum job duration before the process is killed.
    pub timeout_secs: u64,
    /// How often the progress relay wakes up when idle.
    pub progress_poll_ms: u64,
    /// Control artifact handling.
    pub artifact: ArtifactSettings,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-m".to_string(), "scripts.realtime_inference".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            version: "v15".to_string(),
            fps: 25,
            batch_size: 2,
            bbox_shift: 0,
            clip_name: "output".to_string(),
            timeout_secs: 30 * 60,
            progress_poll_ms: 250,
            artifact: ArtifactSettings::default(),
        }
    }
}
