//! Daemon configuration: TOML file + CLI overrides.

use crate::recording::{RecorderPolicy, RecordingMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub recording: RecordingSection,
}

/// `[registry]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            stale_grace_secs: default_stale_grace(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// `[recording]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_recording_root")]
    pub root: String,
    #[serde(default)]
    pub mode: RecordingMode,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub require_consent: bool,
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            root: default_recording_root(),
            mode: RecordingMode::default(),
            storage: default_storage(),
            retention_days: default_retention_days(),
            require_consent: false,
            cleanup_batch: default_cleanup_batch(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_stale_grace() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_recording_root() -> String {
    "~/.tether/recordings".to_string()
}
fn default_storage() -> String {
    "local".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_cleanup_batch() -> usize {
    100
}
fn default_cleanup_interval() -> u64 {
    3600
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub recording_root: Option<String>,
    pub mode: Option<RecordingMode>,
    pub retention_days: Option<u32>,
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct TetherConfig {
    pub stale_grace: Duration,
    pub sweep_interval: Duration,
    pub recording_root: PathBuf,
    pub policy: RecorderPolicy,
    pub cleanup_batch: usize,
    pub cleanup_interval: Duration,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), Overrides::default())
    }
}

impl TetherConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> TetherResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.policy.validate()?;
        if config.sweep_interval.is_zero() || config.cleanup_interval.is_zero() {
            return Err(TetherError::Validation(
                "sweep and cleanup intervals must be positive".into(),
            ));
        }
        Ok(config)
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> Self {
        let root = overrides.recording_root.unwrap_or(file.recording.root);
        Self {
            stale_grace: Duration::from_secs(file.registry.stale_grace_secs),
            sweep_interval: Duration::from_secs(file.registry.sweep_interval_secs),
            recording_root: expand_tilde_str(&root),
            policy: RecorderPolicy {
                mode: overrides.mode.unwrap_or(file.recording.mode),
                storage: file.recording.storage,
                retention_days: overrides
                    .retention_days
                    .unwrap_or(file.recording.retention_days),
                require_consent: file.recording.require_consent,
            },
            cleanup_batch: file.recording.cleanup_batch,
            cleanup_interval: Duration::from_secs(file.recording.cleanup_interval_secs),
        }
    }
}

fn parse(content: &str) -> TetherResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TetherError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
