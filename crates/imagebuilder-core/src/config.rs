use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Engine configuration. Every process-wide setting lives here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory of the image store.
    pub store_root: PathBuf,
    /// Scratch directory for locks and the write-ahead log.
    pub working_dir: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Downgrade "modified without version change" conflicts to warnings.
    #[serde(default)]
    pub skip_checksum_validation: bool,
    /// Validate services on scoped worker threads.
    #[serde(default = "default_parallel")]
    pub parallel_validation: bool,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_parallel() -> bool {
    true
}

impl EngineConfig {
    pub fn new(store_root: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            working_dir: working_dir.into(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            skip_checksum_validation: false,
            parallel_validation: true,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = timeout.as_secs();
        self
    }

    #[must_use]
    pub fn with_skip_checksum_validation(mut self, skip: bool) -> Self {
        self.skip_checksum_validation = skip;
        self
    }

    #[must_use]
    pub fn with_parallel_validation(mut self, parallel: bool) -> Self {
        self.parallel_validation = parallel;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            CoreError::Config(format!("invalid engine config {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("failed to serialize engine config: {e}")))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}
