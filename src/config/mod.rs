//! # Engine Configuration
//!
//! Typed configuration for the operation engine. Values are layered by
//! [`ConfigManager`]: `config/base.toml`, then `config/<environment>.toml`, then
//! `KCP_ENGINE__*` environment variables. Every section has defaults, so a partial
//! file is enough.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kcp_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().queues.provision.workers;
//! let retry = manager.config().executor.retry_delay();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::models::OperationKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/base.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Database connection settings for the Postgres store
    pub database: DatabaseConfig,

    /// Single-stage executor settings
    pub executor: ExecutorConfig,

    /// Weighted pipeline manager settings
    pub manager: ManagerConfig,

    /// Worker pool size per operation kind
    pub queues: QueuesConfig,

    /// Startup recovery of unfinished operations
    pub recovery: RecoveryConfig,

    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        for kind in OperationKind::ALL {
            let workers = self.queues.for_kind(kind).workers;
            if workers == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("queues.{kind}.workers"),
                    workers,
                    "at least one worker is required",
                ));
            }
        }

        if self.manager.speed_factor == 0 {
            return Err(ConfigurationError::invalid_value(
                "manager.speed_factor",
                self.manager.speed_factor,
                "speed factor must be at least 1",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.database.max_connections,
                "connection pool cannot be empty",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Fixed delay before a stage is retried after a recoverable error
    pub retry_delay_ms: u64,
}

impl ExecutorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Fixed delay before a pipeline step is retried after a recoverable error
    pub retry_delay_ms: u64,
    /// Divides every delay the manager reports; 1 means real time
    pub speed_factor: u32,
}

impl ManagerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5_000,
            speed_factor: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { workers: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub provision: QueueConfig,
    pub deprovision: QueueConfig,
    pub update: QueueConfig,
    pub upgrade: QueueConfig,
}

impl QueuesConfig {
    pub fn for_kind(&self, kind: OperationKind) -> QueueConfig {
        match kind {
            OperationKind::Provision => self.provision,
            OperationKind::Deprovision => self.deprovision,
            OperationKind::Update => self.update,
            OperationKind::Upgrade => self.upgrade,
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            provision: QueueConfig::default(),
            deprovision: QueueConfig::default(),
            update: QueueConfig::default(),
            upgrade: QueueConfig { workers: 10 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Re-submit pending and in-progress operations on startup
    pub enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub level: Option<String>,
    pub json: bool,
}
