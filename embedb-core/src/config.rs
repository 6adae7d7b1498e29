//! Orchestrator configuration.
//!
//! Defaults are usable as-is; a JSON file or `EMBEDB_*` environment variables
//! can override individual settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, OrchestratorError, Result};

/// Wait between the graceful and the forced termination signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Per-instance cap on captured server output.
pub const DEFAULT_MAX_LOG_BYTES: usize = 256 * 1024;

const REGISTRY_FILE: &str = "dbs-instances.json";
const BINARIES_DIR: &str = "db-binaries";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Private application data root. Instance directories live directly below it.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Where provisioned `<engine>-<version>` directories go (defaults to `<data_root>/db-binaries`).
    #[serde(default)]
    pub binaries_dir: Option<PathBuf>,

    /// Milliseconds between SIGTERM and SIGKILL when stopping an instance.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Look for engines installed system-wide before provisioned ones.
    #[serde(default = "default_true")]
    pub system_binaries: bool,

    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,

    /// Local directory of pre-fetched archives used instead of downloading.
    #[serde(default)]
    pub archive_mirror: Option<PathBuf>,
}

fn default_data_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join("embedb");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local").join("share").join("embedb");
    }
    std::env::temp_dir().join("embedb")
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_max_log_bytes() -> usize {
    DEFAULT_MAX_LOG_BYTES
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            binaries_dir: None,
            grace_period_ms: default_grace_period_ms(),
            system_binaries: true,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            archive_mirror: None,
        }
    }
}

impl OrchestratorConfig {
    /// Configuration rooted at `data_root` with all other settings defaulted.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .io_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `EMBEDB_DATA_DIR`, `EMBEDB_GRACE_PERIOD_MS`,
    /// `EMBEDB_SYSTEM_BINARIES`, `EMBEDB_MAX_LOG_BYTES` and
    /// `EMBEDB_ARCHIVE_MIRROR` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("EMBEDB_DATA_DIR").filter(|v| !v.is_empty()) {
            config.data_root = PathBuf::from(dir);
        }
        if let Some(ms) = env_parse::<u64>("EMBEDB_GRACE_PERIOD_MS")? {
            config.grace_period_ms = ms;
        }
        if let Some(flag) = env_parse::<bool>("EMBEDB_SYSTEM_BINARIES")? {
            config.system_binaries = flag;
        }
        if let Some(bytes) = env_parse::<usize>("EMBEDB_MAX_LOG_BYTES")? {
            config.max_log_bytes = bytes;
        }
        if let Some(dir) = std::env::var_os("EMBEDB_ARCHIVE_MIRROR").filter(|v| !v.is_empty()) {
            config.archive_mirror = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(OrchestratorError::Config("data_root must not be empty".into()));
        }
        if self.max_log_bytes == 0 {
            return Err(OrchestratorError::Config("max_log_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join(REGISTRY_FILE)
    }

    pub fn binaries_dir(&self) -> PathBuf {
        self.binaries_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join(BINARIES_DIR))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| OrchestratorError::Config(format!("{key}={raw} is not valid"))),
        _ => Ok(None),
    }
}
