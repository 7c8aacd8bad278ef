//! Server configuration.
//!
//! Recognized options mirror spec §6 exactly: executor watermarks, the
//! store's byte budget, and the listener/connection-cap knobs. Loaded from
//! a TOML file and, in `boundedkv-server`, overridable by CLI flags.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Full server configuration. Every field has a sensible default so a
/// config file only needs to override what it cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Minimum resident executor workers.
    pub low_watermark: usize,
    /// Maximum executor workers.
    pub high_watermark: usize,
    /// Maximum queued-but-not-yet-running tasks.
    pub max_queue: usize,
    /// Idle timeout, in milliseconds, before a worker above `low_watermark`
    /// retires.
    pub idle_time_ms: u64,
    /// Thread-per-connection cap (ignored by the event-loop variant).
    pub max_connections: usize,
    /// Per-read timeout, in seconds, for the thread-per-connection variant.
    pub read_timeout_sec: u64,
    /// LRUStore byte budget.
    pub cache_bytes: usize,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// `tracing` filter directive, e.g. `"info"` or `"boundedkv_core=debug"`.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            low_watermark: 2,
            high_watermark: 8,
            max_queue: 128,
            idle_time_ms: 5_000,
            max_connections: 1_000,
            read_timeout_sec: 5,
            cache_bytes: 64 * 1024 * 1024,
            listen_port: 11211,
            log_level: "info".to_string(),
        }
    }
}

/// Errors that can occur while loading or validating a [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed as TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A parsed config violated a cross-field invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Loads a [`ServerConfig`] from a TOML file, validating it before
    /// returning.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text =
            std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
                path: path_ref.display().to_string(),
                source,
            })?;
        let cfg: ServerConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the invariants a [`ServerConfig`] must satisfy before it can
    /// be used to construct the store/executor/connection loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark == 0 {
            return Err(ConfigError::Invalid(
                "low_watermark must be >= 1".to_string(),
            ));
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::Invalid(
                "low_watermark must be <= high_watermark".to_string(),
            ));
        }
        if self.cache_bytes == 0 {
            return Err(ConfigError::Invalid("cache_bytes must be >= 1".to_string()));
        }
        if self.max_queue == 0 {
            return Err(ConfigError::Invalid("max_queue must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_low_watermark_above_high() {
        let mut cfg = ServerConfig::default();
        cfg.low_watermark = 10;
        cfg.high_watermark = 4;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_cache_bytes() {
        let mut cfg = ServerConfig::default();
        cfg.cache_bytes = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file_parses_partial_overrides() {
        let dir = std::env::temp_dir().join(format!(
            "boundedkv-cfg-test-{:?}",
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "listen_port = 9999\ncache_bytes = 1024\n").unwrap();

        let cfg = ServerConfig::load_from_file(&path).expect("should load");
        assert_eq!(cfg.listen_port, 9999);
        assert_eq!(cfg.cache_bytes, 1024);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.low_watermark, ServerConfig::default().low_watermark);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_from_file_missing_file_errors() {
        let err = ServerConfig::load_from_file("/nonexistent/path/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
