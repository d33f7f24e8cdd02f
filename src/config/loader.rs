//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles environment detection, file
//! discovery and layering, then validates the merged result before handing it out.

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix for environment overrides, e.g. `KCP_ENGINE__QUEUES__PROVISION__WORKERS=5`
pub const ENV_PREFIX: &str = "KCP_ENGINE";

/// Loaded and validated engine configuration
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection from `./config`
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(Self::default_config_directory(), &Self::detect_environment())
    }

    /// Load `base.toml` and the optional `<environment>.toml` from `config_dir`,
    /// then apply environment variable overrides
    pub fn load_from_directory(
        config_dir: impl AsRef<Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_dir = config_dir.as_ref();
        if !config_dir.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_dir.display().to_string(),
            });
        }

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_dir.display()
        );

        let settings = Config::builder()
            .add_source(File::from(config_dir.join("base.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{environment}.toml"))).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let manager = Self::finish(
            settings.try_deserialize()?,
            environment,
            Some(config_dir.to_path_buf()),
        )?;
        Ok(Arc::new(manager))
    }

    /// Build from an inline TOML document (no files, no environment overrides)
    pub fn from_toml_str(toml: &str, environment: &str) -> ConfigResult<ConfigManager> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(settings.try_deserialize()?, environment, None)
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: EngineConfig, environment: &str) -> ConfigResult<ConfigManager> {
        Self::finish(config, environment, None)
    }

    fn finish(
        config: EngineConfig,
        environment: &str,
        config_directory: Option<PathBuf>,
    ) -> ConfigResult<ConfigManager> {
        config.validate()?;

        info!(
            environment = environment,
            provision_workers = config.queues.provision.workers,
            deprovision_workers = config.queues.deprovision.workers,
            update_workers = config.queues.update.workers,
            upgrade_workers = config.queues.upgrade.workers,
            "Configuration loaded successfully"
        );

        Ok(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        })
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    /// Current environment from `KCP_ENV`, defaulting to `development`
    pub fn detect_environment() -> String {
        env::var("KCP_ENV").unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("KCP_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}
