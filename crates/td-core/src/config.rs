//! Sync configuration and feature gates.
//!
//! # Hierarchy
//!
//! Settings resolve in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Environment variables: `TD_SYNC_*`
//!
//! Feature flags live in `.todos/features.json` inside the project and can be
//! forced on or off per-flag with `TD_FEATURE_<NAME>`.

use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Enable or disable auto-sync entirely.
pub const ENV_SYNC_AUTO: &str = "TD_SYNC_AUTO";
/// Debounce window between post-mutation syncs.
pub const ENV_SYNC_DEBOUNCE: &str = "TD_SYNC_AUTO_DEBOUNCE";
/// Periodic interval used by external monitors.
pub const ENV_SYNC_INTERVAL: &str = "TD_SYNC_AUTO_INTERVAL";
/// Enable or disable the pull half of auto-sync.
pub const ENV_SYNC_PULL: &str = "TD_SYNC_AUTO_PULL";
/// Enable or disable the startup sync hook.
pub const ENV_SYNC_START: &str = "TD_SYNC_AUTO_START";
/// Event-count threshold for snapshot bootstrap; zero or negative disables.
pub const ENV_SNAPSHOT_THRESHOLD: &str = "TD_SYNC_SNAPSHOT_THRESHOLD";
/// Prefix for per-flag feature overrides.
pub const ENV_FEATURE_PREFIX: &str = "TD_FEATURE_";

/// Name of the feature-flag file inside the project directory.
pub const FEATURES_FILE: &str = "features.json";

// ═══════════════════════════════════════════════════════════════════════════
// SYNC SETTINGS
// ═══════════════════════════════════════════════════════════════════════════

/// Knobs for the auto-sync scheduler and snapshot bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Master switch for auto-sync.
    pub enabled: bool,
    /// Minimum gap between post-mutation syncs.
    pub debounce: Duration,
    /// Interval an external periodic monitor should use.
    pub interval: Duration,
    /// Whether auto-sync also pulls after pushing.
    pub pull_enabled: bool,
    /// Whether the startup hook syncs before the command runs.
    pub on_start_enabled: bool,
    /// Remote event count at which first sync bootstraps from a snapshot.
    /// Zero or negative disables bootstrap.
    pub snapshot_threshold: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_secs(3),
            interval: Duration::from_secs(300),
            pull_enabled: true,
            on_start_enabled: true,
            snapshot_threshold: 1000,
        }
    }
}

impl SyncSettings {
    /// Resolve settings from the environment over the defaults.
    ///
    /// Unparseable values fall back to the default rather than failing the
    /// command; a bad debounce string should never break `td create`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool(ENV_SYNC_AUTO).unwrap_or(defaults.enabled),
            debounce: env_duration(ENV_SYNC_DEBOUNCE).unwrap_or(defaults.debounce),
            interval: env_duration(ENV_SYNC_INTERVAL).unwrap_or(defaults.interval),
            pull_enabled: env_bool(ENV_SYNC_PULL).unwrap_or(defaults.pull_enabled),
            on_start_enabled: env_bool(ENV_SYNC_START).unwrap_or(defaults.on_start_enabled),
            snapshot_threshold: std::env::var(ENV_SNAPSHOT_THRESHOLD)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.snapshot_threshold),
        }
    }

    /// True when snapshot bootstrap is allowed at all.
    #[must_use]
    pub const fn bootstrap_enabled(&self) -> bool {
        self.snapshot_threshold > 0
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_bool(&v))
}

fn env_duration(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|v| parse_duration(&v).ok())
}

/// Parse a boolean flag value: `1`/`true`/`yes`/`on` and their negations.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration string: `250ms`, `3s`, `5m`, `2h`, or a bare number of
/// seconds.
///
/// # Errors
///
/// Returns `Error::InvalidInput` for anything else.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| Error::invalid_input(format!("invalid duration '{value}'")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(Error::invalid_input(format!(
            "invalid duration unit in '{value}'"
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FEATURE GATE
// ═══════════════════════════════════════════════════════════════════════════

/// Opt-in flags for sync-adjacent features.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGate {
    /// Flag name to enabled, as stored on disk.
    #[serde(default, flatten)]
    flags: HashMap<String, bool>,
}

impl FeatureGate {
    /// Load the gate from `<project_dir>/features.json`. A missing file means
    /// every flag is off.
    ///
    /// # Errors
    ///
    /// Returns `Error::Parse` when the file exists but is not valid JSON.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(FEATURES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(Error::from)
    }

    /// Persist the gate to `<project_dir>/features.json`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the file cannot be written.
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = project_dir.join(FEATURES_FILE);
        let raw = serde_json::to_string_pretty(&self.flags)?;
        std::fs::write(path, raw).map_err(Error::from)
    }

    /// Set a flag in memory.
    pub fn set(&mut self, name: impl Into<String>, enabled: bool) {
        self.flags.insert(name.into(), enabled);
    }

    /// Whether a flag is on, with `TD_FEATURE_<NAME>` taking precedence over
    /// the file.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        let env_name = format!("{ENV_FEATURE_PREFIX}{}", name.to_uppercase());
        if let Some(forced) = std::env::var(env_name).ok().and_then(|v| parse_bool(&v)) {
            return forced;
        }
        self.flags.get(name).copied().unwrap_or(false)
    }
}
