//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LipsyncSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `LIPSYNC_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ArtifactMode, LipsyncSettings};

/// Resolve the default settings file (`~/.lipsync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lipsync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LipsyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LipsyncSettings> {
    let defaults = serde_json::to_value(LipsyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LipsyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LIPSYNC_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut LipsyncSettings) {
    apply_overrides(settings, &|name: &str| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are ignored with a warning and the file/default value is kept.
pub fn apply_overrides(settings: &mut LipsyncSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("LIPSYNC_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("LIPSYNC_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_in("LIPSYNC_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v as usize;
    }
    if let Some(v) = env.u64_in("LIPSYNC_MAX_QUEUED_REQUESTS", 0, 1_000) {
        settings.server.max_queued_requests = v as usize;
    }

    // ── Job ─────────────────────────────────────────────────────────
    if let Some(v) = env.string("LIPSYNC_JOB_PROGRAM") {
        settings.job.program = v;
    }
    if let Some(v) = env.string("LIPSYNC_JOB_VERSION") {
        settings.job.version = v;
    }
    if let Some(v) = env.u64_in("LIPSYNC_JOB_FPS", 1, 240) {
        settings.job.fps = v as u32;
    }
    if let Some(v) = env.u64_in("LIPSYNC_JOB_BATCH_SIZE", 1, 1_024) {
        settings.job.batch_size = v as u32;
    }
    if let Some(v) = env.u64_in("LIPSYNC_JOB_TIMEOUT_SECS", 1, 86_400) {
        settings.job.timeout_secs = v;
    }
    if let Some(v) = env.string("LIPSYNC_ARTIFACT_MODE") {
        match serde_json::from_value::<ArtifactMode>(Value::String(v.clone())) {
            Ok(mode) => settings.job.artifact.mode = mode,
            Err(_) => tracing::warn!(key = "LIPSYNC_ARTIFACT_MODE", value = %v, "invalid artifact mode, ignoring"),
        }
    }
    if let Some(v) = env.string("LIPSYNC_SHARED_ARTIFACT") {
        settings.job.artifact.shared_path = Some(PathBuf::from(v));
    }

    // ── Staging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LIPSYNC_WORK_ROOT") {
        settings.staging.work_root = PathBuf::from(v);
    }
    if let Some(v) = env.string("LIPSYNC_PUBLISH_DIR") {
        settings.staging.publish_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env.bool("LIPSYNC_KEEP_INTERMEDIATES") {
        settings.staging.keep_intermediates = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LIPSYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LIPSYNC_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}
