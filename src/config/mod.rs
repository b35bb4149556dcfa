//! # Configuration Management Module
//!
//! All tunables of the badge live in one TOML file, loaded at startup and passed
//! down explicitly. Nothing below `main` reads process-wide settings.
//!
//! ## Configuration Structure
//!
//! - [`TransportConfig`] - which node to talk to and how
//! - [`SupervisorConfig`] - reconnect backoff, attempt ceiling, health probing
//! - [`StorageConfig`] - where the message store and journal live
//! - [`PipelineConfig`] - queue sizes, dedup window, body limits, shutdown drain
//! - [`FeedConfig`] - viewport geometry
//! - [`LoggingConfig`] - log level and file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbadge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Node link: {}", config.transport.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [transport]
//! kind = "serial"
//! port = "/dev/rfcomm0"
//! baud_rate = 115200
//!
//! [supervisor]
//! backoff_base_ms = 1000
//! backoff_cap_ms = 30000
//! max_attempts = 10
//!
//! [storage]
//! data_dir = "./data"
//! ```
//!
//! Every key has a default, so a file only needs the values that differ.
//! CLI flags (`--port`, `--host`) override file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::feed::MAX_VIEWPORT_HEIGHT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Serial device, usually an rfcomm binding.
    pub port: String,
    pub baud_rate: u32,
    pub host: String,
    pub tcp_port: u16,
    /// Channel index used for outbound broadcasts (0 = primary).
    pub channel: u32,
    /// Bound on opening the link plus the config handshake.
    pub connect_timeout_ms: u64,
    /// Largest outbound text accepted, in UTF-8 bytes.
    pub max_text_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            port: "/dev/rfcomm0".to_string(),
            baud_rate: 115200,
            host: "meshtastic.local".to_string(),
            tcp_port: 4403,
            channel: 0,
            connect_timeout_ms: 15_000,
            max_text_bytes: 200, // leaves room for protocol overhead in a 237-byte payload
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// 0 = retry forever.
    pub max_attempts: u32,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_failure_threshold: u32,
    /// Exit the process once the attempt ceiling is hit instead of idling offline.
    pub exit_on_exhausted: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            max_attempts: 10,
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            probe_failure_threshold: 2,
            exit_on_exhausted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub db_dir: String,
    pub journal_file: String,
    /// Messages loaded into the feed at startup.
    pub hydrate_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            db_dir: "messages.db".to_string(),
            journal_file: "meshtastic.log".to_string(),
            hydrate_limit: 2000,
        }
    }
}

impl StorageConfig {
    /// `data_dir` with a leading `~/` expanded.
    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(rest),
                None => PathBuf::from(&self.data_dir),
            },
            None => PathBuf::from(&self.data_dir),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_path().join(&self.db_dir)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_path().join(&self.journal_file)
    }

    /// Counters written by the last run, read back by `meshbadge status`.
    pub fn metrics_path(&self) -> PathBuf {
        self.data_path().join("last_session.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw events buffered between the link and the ingest task.
    pub queue_capacity: usize,
    /// Size of the in-memory recently-seen id set.
    pub dedup_capacity: usize,
    pub max_body_bytes: usize,
    pub drain_timeout_ms: u64,
    pub operator_label: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            dedup_capacity: 4096,
            max_body_bytes: 240,
            drain_timeout_ms: 2_000,
            operator_label: "You".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub viewport_height: usize,
    /// Columns available to the terminal renderer.
    pub width: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            viewport_height: 20,
            width: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshbadge.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub supervisor: SupervisorConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub feed: FeedConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed.viewport_height == 0 || self.feed.viewport_height > MAX_VIEWPORT_HEIGHT {
            return Err(anyhow!(
                "feed.viewport_height must be between 1 and {}",
                MAX_VIEWPORT_HEIGHT
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(anyhow!("pipeline.queue_capacity must be at least 1"));
        }
        if self.pipeline.dedup_capacity == 0 {
            return Err(anyhow!("pipeline.dedup_capacity must be at least 1"));
        }
        if self.supervisor.backoff_base_ms == 0 {
            return Err(anyhow!("supervisor.backoff_base_ms must be positive"));
        }
        if self.supervisor.backoff_cap_ms < self.supervisor.backoff_base_ms {
            return Err(anyhow!(
                "supervisor.backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.supervisor.backoff_cap_ms,
                self.supervisor.backoff_base_ms
            ));
        }
        if self.supervisor.probe_interval_ms == 0 {
            return Err(anyhow!("supervisor.probe_interval_ms must be positive"));
        }
        if self.supervisor.probe_timeout_ms == 0 {
            return Err(anyhow!("supervisor.probe_timeout_ms must be positive"));
        }
        if self.transport.max_text_bytes == 0 {
            return Err(anyhow!("transport.max_text_bytes must be positive"));
        }
        if self.transport.kind == TransportKind::Tcp && self.transport.host.trim().is_empty() {
            return Err(anyhow!("transport.host is required for kind = \"tcp\""));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.drain_timeout_ms)
    }

    /// Log file for `start`. The feed owns the terminal, so a run without a
    /// configured file logs to `data_dir/meshbadge.log`.
    pub fn foreground_log_path(&self) -> PathBuf {
        match &self.logging.file {
            Some(file) => PathBuf::from(file),
            None => self.storage.data_path().join("meshbadge.log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_badge_layout() {
        let config = Config::default();
        assert_eq!(config.transport.port, "/dev/rfcomm0");
        assert_eq!(config.transport.kind, TransportKind::Serial);
        assert_eq!(config.pipeline.max_body_bytes, 240);
        assert_eq!(config.storage.hydrate_limit, 2000);
        assert_eq!(config.supervisor.probe_failure_threshold, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transport]
            kind = "tcp"
            host = "10.0.0.7"

            [feed]
            viewport_height = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.transport.tcp_port, 4403);
        assert_eq!(config.feed.viewport_height, 8);
        assert_eq!(config.supervisor.backoff_cap_ms, 30_000);
    }

    #[test]
    fn unknown_transport_kind_is_rejected() {
        let parsed: std::result::Result<Config, _> = toml::from_str("[transport]\nkind = \"pigeon\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff_and_zero_viewport() {
        let mut config = Config::default();
        config.supervisor.backoff_cap_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.feed.viewport_height = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.feed.viewport_height = MAX_VIEWPORT_HEIGHT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_probe_timings() {
        let mut config = Config::default();
        config.supervisor.probe_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.probe_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_paths_hang_off_data_dir() {
        let storage = StorageConfig {
            data_dir: "/var/lib/badge".into(),
            ..Default::default()
        };
        assert_eq!(storage.db_path(), PathBuf::from("/var/lib/badge/messages.db"));
        assert_eq!(
            storage.journal_path(),
            PathBuf::from("/var/lib/badge/meshtastic.log")
        );
    }

    #[test]
    fn foreground_logging_always_has_a_file() {
        let mut config = Config::default();
        config.storage.data_dir = "/var/lib/badge".into();
        config.logging.file = Some("custom.log".into());
        assert_eq!(config.foreground_log_path(), PathBuf::from("custom.log"));
        config.logging.file = None;
        assert_eq!(
            config.foreground_log_path(),
            PathBuf::from("/var/lib/badge/meshbadge.log")
        );
    }

    #[tokio::test]
    async fn default_file_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.transport.port, "/dev/rfcomm0");
    }
}
