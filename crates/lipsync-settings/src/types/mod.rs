//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`: missing fields
//! in `settings.json` fall back to their production defaults.

mod job;
mod server;

pub use job::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "job": { "program": "python", "timeoutSecs": 900 },
///   "staging": { "workRoot": "/var/lib/lipsync" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LipsyncSettings {
    /// Network and session settings.
    pub server: ServerSettings,
    /// External job runner invocation.
    pub job: JobSettings,
    /// Scratch and result directories.
    pub staging: StagingSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl LipsyncSettings {
    /// Reject combinations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SettingsError::InvalidValue(msg.to_string()));

        if self.job.program.trim().is_empty() {
            return invalid("job.program must not be empty");
        }
        if self.job.fps == 0 {
            return invalid("job.fps must be positive");
        }
        if self.job.batch_size == 0 {
            return invalid("job.batchSize must be positive");
        }
        if self.job.timeout_secs == 0 {
            return invalid("job.timeoutSecs must be positive");
        }
        if self.job.clip_name.is_empty()
            || !self
                .job
                .clip_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return invalid("job.clipName must be a plain file stem");
        }
        if self.job.artifact.mode == ArtifactMode::Shared && self.job.artifact.shared_path.is_none() {
            return invalid("job.artifact.sharedPath is required in shared mode");
        }
        if self.server.heartbeat_timeout_secs <= self.server.heartbeat_interval_secs {
            return invalid("server.heartbeatTimeoutSecs must exceed heartbeatIntervalSecs");
        }
        Ok(())
    }
}
