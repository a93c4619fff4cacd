//! Server, staging and logging settings.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Network and per-session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Largest accepted inbound message in bytes.
    pub max_message_bytes: usize,
    /// Interval between server pings.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any inbound traffic.
    pub heartbeat_timeout_secs: u64,
    /// Requests buffered behind the in-flight one before `busy` is returned.
    pub max_queued_requests: usize,
    /// Grace period for in-flight work on shutdown or disconnect.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_connections: 64,
            max_message_bytes: 64 * 1024 * 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            max_queued_requests: 4,
            shutdown_grace_secs: 10,
        }
    }
}

/// Where inputs, scratch and results live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StagingSettings {
    /// Root for per-job scratch directories and per-job control artifacts.
    pub work_root: PathBuf,
    /// When set, every successful result is also copied here as
    /// `<job_name>.mp4`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<PathBuf>,
    /// Keep `output/`, `tmp/` and `results/` after a request finishes.
    pub keep_intermediates: bool,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("lipsync"),
            publish_dir: None,
            keep_intermediates: false,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace` … `error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-target overrides, e.g. `{"lipsync_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
