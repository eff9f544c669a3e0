//! Configuration types for sitedump

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Result, SiteDumpError};

/// Where sessions and exchanges are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database file
    #[default]
    Sqlite,
    /// Process memory, lost on exit
    Memory,
}

/// When a dump is declared complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionMode {
    /// As soon as the primary document has loaded; late subresources are
    /// captured in the background for `linger_ms`
    Load,
    /// After the network has been quiet for `idle_ms` and every in-flight
    /// capture write has finished
    #[default]
    NetworkIdle,
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Control surface settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Dump completion settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Built-in browsing engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file for the SQLite backend
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("dumps/dumps.sqlite3")
}

/// Control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Offset from UTC, in minutes, for times shown on the index page
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            utc_offset_minutes: 0,
        }
    }
}

impl ServerConfig {
    /// Offset used to display timestamps; UTC if out of range
    #[must_use]
    pub fn display_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

/// Dump completion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Completion signal
    pub completion: CompletionMode,
    /// Quiet window that counts as network idle
    pub idle_ms: u64,
    /// Upper bound on waiting for network idle
    pub timeout_ms: u64,
    /// How long a `load`-mode dump keeps capturing after returning
    pub linger_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::NetworkIdle,
            idle_ms: 500,
            timeout_ms: 30_000,
            linger_ms: 10_000,
        }
    }
}

impl CaptureConfig {
    /// Quiet window as a duration
    #[must_use]
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Idle wait bound as a duration
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Background capture window as a duration
    #[must_use]
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Built-in browsing engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// User-Agent sent with every fetch
    pub user_agent: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Maximum subresources fetched per navigation
    pub max_subresources: usize,
    /// Redirect hops followed per fetch before giving up
    pub max_redirects: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sitedump/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_ms: 30_000,
            max_subresources: 256,
            max_redirects: 20,
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent control-surface connections
    pub max_connections: usize,
    /// Maximum control-surface request body in bytes
    pub max_request_size: usize,
    /// Maximum captured response body in bytes
    pub max_response_size: usize,
    /// Maximum dumps running (or shows starting) at once
    pub max_concurrent_sessions: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_request_size: 64 * 1024,          // 64 KB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_concurrent_sessions: 16,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SiteDumpError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| SiteDumpError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(SiteDumpError::ConfigError(
                "storage.path cannot be empty for the sqlite backend".to_string(),
            ));
        }

        if self.server.listen_port == 0 {
            return Err(SiteDumpError::ConfigError(
                "server.listen_port cannot be 0".to_string(),
            ));
        }

        if self.server.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(SiteDumpError::ConfigError(format!(
                "server.utc_offset_minutes ({}) must be within a day",
                self.server.utc_offset_minutes
            )));
        }

        if self.capture.timeout_ms < self.capture.idle_ms {
            return Err(SiteDumpError::ConfigError(format!(
                "capture.timeout_ms ({}) must be >= capture.idle_ms ({})",
                self.capture.timeout_ms, self.capture.idle_ms
            )));
        }

        for (name, value) in [
            ("limits.max_connections", self.limits.max_connections),
            ("limits.max_request_size", self.limits.max_request_size),
            ("limits.max_response_size", self.limits.max_response_size),
            ("limits.max_concurrent_sessions", self.limits.max_concurrent_sessions),
        ] {
            if value == 0 {
                return Err(SiteDumpError::ConfigError(format!("{name} must be > 0")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.server.listen_port, 3000);
        assert_eq!(config.capture.completion, CompletionMode::NetworkIdle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            [storage]
            backend = "memory"

            [server]
            listen_port = 8080

            [capture]
            completion = "load"
            linger_ms = 2000
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.capture.completion, CompletionMode::Load);
        assert_eq!(config.capture.linger(), Duration::from_secs(2));
        assert_eq!(config.capture.idle_ms, 500);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            [storage]
            path = "/tmp/sitedump-test.sqlite3"

            [capture]
            completion = "network-idle"
            idle_ms = 100
            timeout_ms = 1000
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.capture.idle(), Duration::from_millis(100));
        assert_eq!(config.storage.path, PathBuf::from("/tmp/sitedump-test.sqlite3"));
    }

    #[test]
    fn test_invalid_timeout_below_idle() {
        let config: Config = toml::from_str(
            r"
            [capture]
            idle_ms = 5000
            timeout_ms = 100
        ",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_display_offset() {
        let config: Config = toml::from_str(
            r"
            [server]
            utc_offset_minutes = 540
        ",
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.display_offset().local_minus_utc(), 9 * 3600);
        assert_eq!(Config::default().server.display_offset().local_minus_utc(), 0);

        let mut config = Config::default();
        config.server.utc_offset_minutes = -24 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_zero_limit() {
        let mut config = Config::default();
        config.limits.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_completion_mode_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
            [capture]
            completion = "eventually"
        "#,
        );
        assert!(result.is_err());
    }
}
