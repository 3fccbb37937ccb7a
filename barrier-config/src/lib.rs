//! Configuration management for barrier hosts

use config::ConfigError;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Where wrapped key records are persisted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StorageSettings {
    /// Embedded single-file SQLite database
    Sqlite { path: String },
    /// Client/server PostgreSQL database
    Postgres { url: String },
    /// Process memory only (tests, ephemeral hosts)
    Memory,
}

impl FromStr for StorageSettings {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "memory" {
            return Ok(Self::Memory);
        }
        if let Some(path) = value.strip_prefix("sqlite:") {
            if path.is_empty() {
                return Err(ConfigError::Message(
                    "BARRIER_STORAGE sqlite path is empty".to_string(),
                ));
            }
            return Ok(Self::Sqlite {
                path: path.to_string(),
            });
        }
        if value.starts_with("postgres://") || value.starts_with("postgresql://") {
            return Ok(Self::Postgres {
                url: value.to_string(),
            });
        }
        Err(ConfigError::Message(format!(
            "Unsupported BARRIER_STORAGE value: {}",
            value
        )))
    }
}

/// Key cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    /// Maximum number of cached keys; 0 disables the cache
    pub capacity: usize,
}

/// Storage call configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageCallSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Barrier configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BarrierSettings {
    pub storage: StorageSettings,
    /// Algorithm name for newly generated keys
    pub algorithm: String,
    pub cache: CacheSettings,
    pub storage_calls: StorageCallSettings,
    pub log_level: Option<String>,
}

impl BarrierSettings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = lookup("BARRIER_STORAGE")
            .unwrap_or_else(|| "sqlite:./barrier.db".to_string())
            .parse()?;

        let algorithm = lookup("BARRIER_ALGORITHM")
            .unwrap_or_else(|| "aes-256-gcm".to_string());

        let cache = CacheSettings {
            ttl_secs: parse_or(&lookup, "BARRIER_CACHE_TTL_SECS", 300)?,
            capacity: parse_or(&lookup, "BARRIER_CACHE_CAPACITY", 64)?,
        };

        let storage_calls = StorageCallSettings {
            timeout_ms: parse_or(&lookup, "BARRIER_STORAGE_TIMEOUT_MS", 5_000)?,
            max_retries: parse_or(&lookup, "BARRIER_STORAGE_RETRIES", 3)?,
            initial_delay_ms: parse_or(&lookup, "BARRIER_RETRY_INITIAL_DELAY_MS", 50)?,
            max_delay_ms: parse_or(&lookup, "BARRIER_RETRY_MAX_DELAY_MS", 2_000)?,
        };

        if storage_calls.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "BARRIER_STORAGE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            storage,
            algorithm,
            cache,
            storage_calls,
            log_level: Some(log_level),
        })
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Message(format!("Invalid value for {}: {}", name, raw))),
        None => Ok(default),
    }
}
