//! Relay configuration, read from `~/.freeman/relay.yaml`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub topic_capacity: usize,
    pub user_agent: String,
    /// Where RPC schema scratch directories are created; system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
    pub log_file: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_grace_ms: DEFAULT_DISCONNECT_GRACE_MS,
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            user_agent: format!("freeman-relay/{}", APP_VERSION),
            scratch_dir: None,
            log_file: PathBuf::from("freeman-relay.log"),
            log_level: String::from("info"),
        }
    }
}

impl Config {
    /// Default config location
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Load from the default location, falling back to defaults when the file is missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("relay.yaml")).unwrap();
        assert_eq!(config.http_timeout_ms, DEFAULT_HTTP_TIMEOUT_MS);
        assert_eq!(config.topic_capacity, DEFAULT_TOPIC_CAPACITY);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "http_timeout_ms: 500\nlog_level: debug\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.http_timeout(), Duration::from_millis(500));
        assert_eq!(config.log_level(), tracing::Level::DEBUG);
        assert_eq!(config.rpc_timeout_ms, DEFAULT_RPC_TIMEOUT_MS);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "http_timeout_ms: [not, a, number]\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
