//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// SQLite page cache size in MB per connection (default: 16).
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Accepted records per staging write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Progress is also reported every N lines, independent of batch flushes
    #[serde(default = "default_progress_interval_lines")]
    pub progress_interval_lines: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_top_urls_limit")]
    pub top_urls_limit: u32,
    #[serde(default = "default_top_users_limit")]
    pub top_users_limit: u32,
    /// Recompute the default snapshot every N seconds (0 disables the task)
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "logstats.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_cache_size_mb() -> u32 {
    16
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    5_000
}

fn default_progress_interval_lines() -> u64 {
    100_000
}

fn default_top_urls_limit() -> u32 {
    100
}

fn default_top_users_limit() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            cache_size_mb: default_cache_size_mb(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            progress_interval_lines: default_progress_interval_lines(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            top_urls_limit: default_top_urls_limit(),
            top_users_limit: default_top_users_limit(),
            refresh_interval_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("LOGSTATS").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        // The ingestion job pins one connection for its whole run
        if self.database.max_connections < 2 {
            anyhow::bail!("database.max_connections must be at least 2");
        }

        // Multi-row inserts are chunked, but a single batch still lives in memory
        if self.ingestion.batch_size == 0 || self.ingestion.batch_size > 50_000 {
            anyhow::bail!(
                "Invalid ingestion.batch_size {}. Must be between 1 and 50000",
                self.ingestion.batch_size
            );
        }

        if self.stats.top_urls_limit == 0 || self.stats.top_users_limit == 0 {
            anyhow::bail!("Top list limits must be greater than 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            ingestion: IngestionConfig::default(),
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.batch_size, 5_000);
        assert_eq!(config.stats.top_urls_limit, 100);
        assert_eq!(config.stats.top_users_limit, 10);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = Config::default();
        config.ingestion.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[database]\nurl = \"/tmp/other.db\"\n[ingestion]\nbatch_size = 250\n",
                config::FileFormat::Toml,
            ))
            .build()
            .expect("build settings");
        let config: Config = settings.try_deserialize().expect("deserialize");

        assert_eq!(config.database.url, "/tmp/other.db");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.ingestion.batch_size, 250);
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }
}
