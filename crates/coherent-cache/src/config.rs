use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::Codec;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
    /// Names of the coherence channels
    #[serde(default)]
    pub channels: ChannelsConfig,
    /// Subscription listener timing
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Wire format for values and messages
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.url.trim().is_empty() {
            return Err("redis.url must not be empty".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        if self.channels.invalidate.is_empty() || self.channels.clear.is_empty() {
            return Err("channels.invalidate and channels.clear must not be empty".into());
        }
        if self.channels.invalidate == self.channels.clear {
            return Err("channels.invalidate and channels.clear must differ".into());
        }
        if self.listener.reconnect_delay_ms == 0 {
            return Err("listener.reconnect_delay_ms must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Channel carrying single-key invalidations
    #[serde(default = "default_invalidate_channel")]
    pub invalidate: String,
    /// Channel carrying full clears
    #[serde(default = "default_clear_channel")]
    pub clear: String,
}

fn default_invalidate_channel() -> String {
    "cache:invalidate".to_string()
}

fn default_clear_channel() -> String {
    "cache:clear".to_string()
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            invalidate: default_invalidate_channel(),
            clear: default_clear_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Fixed delay before resubscribing after a lost connection
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// How long a subscribe call waits for the connection to become active
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// How long shutdown waits for the worker before aborting it
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_start_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<CacheConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("coherent-cache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., COHERENT_CACHE__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("COHERENT_CACHE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CacheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.channels.invalidate, "cache:invalidate");
        assert_eq!(cfg.channels.clear, "cache:clear");
        assert_eq!(cfg.listener.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.codec, Codec::Json);
    }

    #[test]
    fn identical_channels_are_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.channels.clear = cfg.channels.invalidate.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }
}
