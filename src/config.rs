//! Configuration handling for meshctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Config file looked up in the working directory first
pub const LOCAL_CONFIG: &str = "meshctl.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub up: UpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local socket meshd listens on
    pub socket_path: PathBuf,
    /// Per-request I/O timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpConfig {
    /// Give up waiting for the daemon to reach Running after this long
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig {
                socket_path: default_socket_path(),
                request_timeout_secs: default_request_timeout(),
            },
            up: UpConfig::default(),
        }
    }
}

#[cfg(windows)]
fn default_socket_path() -> PathBuf {
    PathBuf::from(r"\\.\pipe\ProtectedPrefix\Administrators\meshd\meshd")
}

#[cfg(not(windows))]
fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/meshd/meshd.sock")
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the working directory, then the user config directory,
    /// falling back to defaults when neither exists.
    pub fn discover() -> Result<Self, ConfigError> {
        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            debug!("Using config {}", local_config.display());
            return Self::load(&local_config);
        }

        if let Some(dir) = dirs::config_dir() {
            let user_config = dir.join("meshctl").join("config.toml");
            if user_config.exists() {
                debug!("Using config {}", user_config.display());
                return Self::load(&user_config);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.request_timeout_secs)
    }

    pub fn up_timeout(&self) -> Option<Duration> {
        self.up.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = ClientConfig::default();
        config.up.timeout_secs = Some(30);
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.up_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [daemon]
            socket_path = "/tmp/meshd.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/meshd.sock"));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.up_timeout(), None);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load(Path::new("/nonexistent/meshctl.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "daemon = [").unwrap();

        let result = ClientConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
