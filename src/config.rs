//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Prefix for environment overrides, e.g. `TURNSTILE__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Where counters are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rules file overriding the built-in table
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Seconds between sweeps of expired in-memory counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Raise quotas for roles with a registered tier
    #[serde(default = "default_role_adjustment")]
    pub role_adjustment: bool,

    /// Counter backing
    #[serde(default)]
    pub backend: BackendKind,

    /// Settings for the redis backing
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            sweep_interval_secs: default_sweep_interval(),
            role_adjustment: default_role_adjustment(),
            backend: BackendKind::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    crate::ratelimit::DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_role_adjustment() -> bool {
    true
}

/// Redis backing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call budget in milliseconds; slower calls fail open
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_redis_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    crate::ratelimit::DEFAULT_KEY_PREFIX.to_string()
}

fn default_redis_timeout() -> u64 {
    50
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then an optional file, then `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work, before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "rate_limiting.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.rate_limiting.backend == BackendKind::Redis
            && self.rate_limiting.redis.timeout_ms == 0
        {
            return Err(TurnstileError::Config(
                "rate_limiting.redis.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.rate_limiting.backend, BackendKind::Memory);
        assert!(config.rate_limiting.role_adjustment);
        assert_eq!(config.rate_limiting.redis.key_prefix, "rate_limit");
        assert_eq!(config.rate_limiting.redis.timeout(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
rate_limiting:
  backend: redis
  redis:
    url: redis://cache:6379
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limiting.backend, BackendKind::Redis);
        assert_eq!(config.rate_limiting.redis.url, "redis://cache:6379");
        assert_eq!(config.rate_limiting.redis.timeout_ms, 50);
        assert_eq!(config.server.http_addr, default_http_addr());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = TurnstileConfig::default();
        config.rate_limiting.sweep_interval_secs = 0;
        assert!(matches!(config.validate(), Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_redis_timeout() {
        let mut config = TurnstileConfig::default();
        config.rate_limiting.backend = BackendKind::Redis;
        config.rate_limiting.redis.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.sweep_interval_secs, 300);
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let path = std::env::temp_dir()
            .join(format!("turnstile-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "server:\n  http_addr: 0.0.0.0:9000\n").unwrap();

        let config = TurnstileConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:9000".parse().unwrap());

        std::fs::remove_file(path).unwrap();
    }
}
