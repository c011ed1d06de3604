//! CR-008: Runtime settings threaded through stores, registry and pipelines.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default persistence directory.
pub const DIRECTORY_ENV: &str = "CORRAL_DIRECTORY";

/// Environment variable overriding the per-call plugin timeout (seconds, 0 disables).
pub const PLUGIN_TIMEOUT_ENV: &str = "CORRAL_PLUGIN_TIMEOUT_SECS";

const DEFAULT_DIRECTORY: &str = ".corral";
const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 1800;

/// Explicit configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where the document stores and event logs live
    pub directory: PathBuf,

    /// Where plugin default configs are materialized on install
    pub config_dir: PathBuf,

    /// Upper bound for a single plugin call; `None` waits forever
    pub plugin_timeout: Option<Duration>,

    /// Worker count for the blocking configure stage
    pub configure_workers: usize,
}

impl Settings {
    /// Settings rooted at `directory`, with defaults for everything else.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            config_dir: directory.join("plugins"),
            directory,
            plugin_timeout: Some(Duration::from_secs(DEFAULT_PLUGIN_TIMEOUT_SECS)),
            configure_workers: default_configure_workers(),
        }
    }

    /// Settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let directory = std::env::var_os(DIRECTORY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY));
        let mut settings = Self::new(directory);
        if let Ok(raw) = std::env::var(PLUGIN_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(0) => settings.plugin_timeout = None,
                Ok(secs) => settings.plugin_timeout = Some(Duration::from_secs(secs)),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {}", PLUGIN_TIMEOUT_ENV),
            }
        }
        settings
    }

    /// Same settings, persisted under another directory.
    pub fn with_directory(mut self, directory: &Path) -> Self {
        self.config_dir = directory.join("plugins");
        self.directory = directory.to_path_buf();
        self
    }

    pub fn with_plugin_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.plugin_timeout = timeout;
        self
    }

    pub fn with_configure_workers(mut self, workers: usize) -> Self {
        self.configure_workers = workers.max(1);
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTORY)
    }
}

/// A quarter of the available CPUs, at least one.
pub fn default_configure_workers() -> usize {
    (num_cpus::get() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr008_defaults() {
        let s = Settings::new("/var/lib/corral");
        assert_eq!(s.directory, PathBuf::from("/var/lib/corral"));
        assert_eq!(s.config_dir, PathBuf::from("/var/lib/corral/plugins"));
        assert_eq!(s.plugin_timeout, Some(Duration::from_secs(1800)));
        assert!(s.configure_workers >= 1);
    }

    #[test]
    fn test_cr008_with_directory_moves_config_dir() {
        let s = Settings::new("a").with_directory(Path::new("b"));
        assert_eq!(s.directory, PathBuf::from("b"));
        assert_eq!(s.config_dir, PathBuf::from("b/plugins"));
    }

    #[test]
    fn test_cr008_configure_workers_minimum() {
        let s = Settings::new("a").with_configure_workers(0);
        assert_eq!(s.configure_workers, 1);
        assert!(default_configure_workers() >= 1);
    }
}
