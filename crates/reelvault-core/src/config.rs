//! Server configuration loaded from TOML

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::Phase;
use crate::{Error, Result};

/// Main configuration structure for reelvault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::validation(format!("failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::validation(format!("failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        if let Ok(config_path) = std::env::var("REELVAULT_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = ["./reelvault.toml", "/etc/reelvault/config.toml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::validation("invalid server port"));
        }

        if self.database.max_connections == 0 {
            return Err(Error::validation("database max_connections must be > 0"));
        }

        if self.jobs.queue_cap == 0 {
            return Err(Error::validation("jobs queue_cap must be > 0"));
        }

        if self.streaming.max_global == 0 || self.streaming.max_per_ip == 0 {
            return Err(Error::validation("streaming limits must be > 0"));
        }

        if self.streaming.max_per_ip > self.streaming.max_global {
            return Err(Error::validation(
                "streaming max_per_ip cannot exceed max_global",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root directory scanned for source media
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    /// Where generated thumbnails and sprite sheets land
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,

    /// Kick off a library scan when the server starts
    #[serde(default)]
    pub scan_on_start: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            media_dir: default_media_dir(),
            artifacts_dir: default_artifacts_dir(),
            scan_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Soft cap per worker-pool queue; submits beyond it fail fast
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,

    /// Per-phase execution timeouts, seconds
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_s: u64,

    #[serde(default = "default_thumbnail_timeout")]
    pub thumbnail_timeout_s: u64,

    #[serde(default = "default_sprites_timeout")]
    pub sprites_timeout_s: u64,

    /// Retry sweeper tick, seconds
    #[serde(default = "default_retry_tick")]
    pub retry_tick_s: u64,

    /// Jobs swept per retry tick
    #[serde(default = "default_retry_page")]
    pub retry_page: usize,

    /// Terminal jobs older than this are garbage collected
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Max submissions accepted by one bulk call
    #[serde(default = "default_bulk_cap")]
    pub bulk_cap: usize,

    /// Grace period for draining pools at shutdown, seconds
    #[serde(default = "default_drain_grace")]
    pub drain_grace_s: u64,
}

impl JobsConfig {
    /// Execution timeout for a phase
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Metadata => self.metadata_timeout_s,
            Phase::Thumbnail => self.thumbnail_timeout_s,
            Phase::Sprites => self.sprites_timeout_s,
        };
        Duration::from_secs(secs)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue_cap: default_queue_cap(),
            metadata_timeout_s: default_metadata_timeout(),
            thumbnail_timeout_s: default_thumbnail_timeout(),
            sprites_timeout_s: default_sprites_timeout(),
            retry_tick_s: default_retry_tick(),
            retry_page: default_retry_page(),
            retention_days: default_retention_days(),
            bulk_cap: default_bulk_cap(),
            drain_grace_s: default_drain_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Max concurrent (ip, scene) stream slots across all clients
    #[serde(default = "default_max_global")]
    pub max_global: usize,

    /// Max distinct scenes streamed concurrently by one IP
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: usize,

    /// Scene-path LRU cache capacity
    #[serde(default = "default_path_cache_size")]
    pub path_cache_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_global: default_max_global(),
            max_per_ip: default_max_per_ip(),
            path_cache_size: default_path_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber ring-buffer capacity
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,

    /// Interval between full `jobs:status` snapshots on SSE, seconds
    #[serde(default = "default_status_interval")]
    pub status_interval_s: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: default_event_buffer(),
            status_interval_s: default_status_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7420
}

fn default_db_path() -> String {
    "./reelvault.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_media_dir() -> String {
    "./media".to_string()
}

fn default_artifacts_dir() -> String {
    "./artifacts".to_string()
}

fn default_queue_cap() -> usize {
    1024
}

fn default_metadata_timeout() -> u64 {
    60
}

fn default_thumbnail_timeout() -> u64 {
    120
}

fn default_sprites_timeout() -> u64 {
    600
}

fn default_retry_tick() -> u64 {
    5
}

fn default_retry_page() -> usize {
    100
}

fn default_retention_days() -> u32 {
    30
}

fn default_bulk_cap() -> usize {
    10_000
}

fn default_drain_grace() -> u64 {
    30
}

fn default_max_global() -> usize {
    64
}

fn default_max_per_ip() -> usize {
    4
}

fn default_path_cache_size() -> usize {
    512
}

fn default_event_buffer() -> usize {
    256
}

fn default_status_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jobs.timeout_for(Phase::Metadata), Duration::from_secs(60));
        assert_eq!(config.jobs.timeout_for(Phase::Sprites), Duration::from_secs(600));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [streaming]
            max_per_ip = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.streaming.max_per_ip, 2);
        assert_eq!(config.streaming.max_global, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = Config::default();
        config.streaming.max_per_ip = 100;
        config.streaming.max_global = 10;
        assert!(config.validate().is_err());
    }
}
