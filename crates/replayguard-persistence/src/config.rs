use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Key namespace prefixed to every cache and lock key
    pub namespace: String,
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: "replayguard".to_string(),
            connection_timeout_ms: 5000,
        }
    }
}

impl RedisStoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REPLAYGUARD_REDIS_URL") {
            config.url = url;
        } else if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }

        if let Ok(namespace) = std::env::var("REPLAYGUARD_REDIS_NAMESPACE") {
            if !namespace.is_empty() {
                config.namespace = namespace;
            }
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.namespace.contains(':') {
            return Err("Namespace cannot contain ':'".to_string());
        }
        if self.connection_timeout_ms == 0 {
            return Err("Connection timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// PostgreSQL backend configuration
#[cfg(feature = "postgres")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresStoreConfig {
    /// Connection URL
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

#[cfg(feature = "postgres")]
impl Default for PostgresStoreConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/replayguard".to_string(),
            max_connections: 10,
        }
    }
}

#[cfg(feature = "postgres")]
impl PostgresStoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REPLAYGUARD_DATABASE_URL") {
            config.url = url;
        } else if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }

        if let Ok(max) = std::env::var("REPLAYGUARD_PG_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.max_connections == 0 {
            return Err("Pool size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Expiry sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Interval between sweeps in seconds
    pub interval_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60 * 60,
        }
    }
}

impl SweeperConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secs) = std::env::var("REPLAYGUARD_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                if secs > 0 {
                    config.interval_seconds = secs;
                }
            }
        }

        config
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_defaults() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.namespace, "replayguard");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_namespace_rejects_separator() {
        let config = RedisStoreConfig {
            namespace: "a:b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_connection_timeout_rejected() {
        let config = RedisStoreConfig {
            connection_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweeper_default_interval_is_one_hour() {
        assert_eq!(SweeperConfig::default().interval(), Duration::from_secs(3600));
    }
}
