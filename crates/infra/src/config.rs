//! Environment configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `DATABASE_MAX_CONNECTIONS` | `5` |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `INVENTORY_CHANNEL` | `inventory.product_inventory` |
//! | `RESERVATION_CHANNEL` | `inventory.reservation` |
//! | `PUBLISH_TIMEOUT_MS` | `5000` |
//!
//! Empty values count as unset.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockflow_inventory::ServiceConfig;

use crate::publisher::Topics;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub use_persistent_stores: bool,
    /// Present exactly when `use_persistent_stores` is set.
    pub postgres: Option<PostgresConfig>,
    pub redis_url: String,
    pub topics: Topics,
    pub publish_timeout: Duration,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            postgres: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            topics: Topics::default(),
            publish_timeout: ServiceConfig::DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(value) => parse_flag("USE_PERSISTENT_STORES", &value)?,
            None => false,
        };

        let postgres = if use_persistent_stores {
            Some(PostgresConfig {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    get("DATABASE_MAX_CONNECTIONS"),
                    DEFAULT_MAX_CONNECTIONS,
                )?,
            })
        } else {
            None
        };

        let timeout_ms = parse_or(
            "PUBLISH_TIMEOUT_MS",
            get("PUBLISH_TIMEOUT_MS"),
            defaults.publish_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            use_persistent_stores,
            postgres,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            topics: Topics {
                inventory: get("INVENTORY_CHANNEL").unwrap_or(defaults.topics.inventory),
                reservation: get("RESERVATION_CHANNEL").unwrap_or(defaults.topics.reservation),
            },
            publish_timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            publish_timeout: self.publish_timeout,
        }
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_or<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match value {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
