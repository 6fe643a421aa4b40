//! Runtime configuration (`strand.toml`).
//!
//! Searches the current directory then its ancestors for `strand.toml`,
//! falling back to [`RuntimeConfig::default`] when none is found.
//!
//! ```toml
//! worker_threads = 4
//! yield_op_count = 2048
//! thread_name_prefix = "strand-worker"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name looked up by [`RuntimeConfig::load`].
pub const CONFIG_FILE_NAME: &str = "strand.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker OS threads. `0` means one per available CPU.
    pub worker_threads: usize,
    /// Operations a fiber may run before it yields its worker.
    pub yield_op_count: usize,
    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            yield_op_count: 2048,
            thread_name_prefix: "strand-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load config from `strand.toml`, searching current dir then parents.
    /// Returns `Default` when no file is found.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse and validate a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.yield_op_count == 0 {
            return Err(ConfigError::Invalid(
                "yield_op_count must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The worker count after resolving `0` to the CPU count.
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    fn find() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_returns_default() {
        assert_eq!(RuntimeConfig::from_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn parse_all_fields() {
        let cfg = RuntimeConfig::from_str(
            r#"
worker_threads = 3
yield_op_count = 16
thread_name_prefix = "app"
"#,
        )
        .unwrap();
        assert_eq!(cfg.worker_threads, 3);
        assert_eq!(cfg.yield_op_count, 16);
        assert_eq!(cfg.thread_name_prefix, "app");
        assert_eq!(cfg.resolved_worker_threads(), 3);
    }

    #[test]
    fn zero_yield_op_count_is_rejected() {
        let err = RuntimeConfig::from_str("yield_op_count = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("yield_op_count"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RuntimeConfig::from_str("workers = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(RuntimeConfig::from_str("this is not toml [[[").is_err());
    }

    #[test]
    fn zero_workers_resolves_to_cpu_count() {
        assert!(RuntimeConfig::default().resolved_worker_threads() >= 1);
    }

    #[test]
    fn load_from_reads_file() {
        let dir = std::env::temp_dir().join(format!("strand-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "worker_threads = 2\n").unwrap();

        let cfg = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(cfg.worker_threads, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = RuntimeConfig::load_from(Path::new("/definitely/not/here/strand.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
