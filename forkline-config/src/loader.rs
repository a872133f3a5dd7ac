//! Configuration loading and environment variable handling

use crate::domains::ForklineConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "FORKLINE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ForklineConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ForklineConfig = serde_yaml::from_str(&content)?;

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ForklineConfig> {
        let mut config = ForklineConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ForklineConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ForklineConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply pool config overrides
    fn apply_pool_overrides(
        &self,
        config: &mut crate::domains::pool::PoolConfig,
    ) -> ConfigResult<()> {
        if let Some(workers) = self.parse_env_var::<usize>("WORKER_COUNT")? {
            config.worker_count = workers;
        }

        if let Some(batch_size) = self.parse_env_var::<usize>("BATCH_SIZE")? {
            config.batch_size = Some(batch_size);
        }

        if let Some(wrap) = self.parse_env_var::<bool>("WRAP_EXCEPTIONS")? {
            config.wrap_exceptions = wrap;
        }

        if let Some(millis) = self.parse_env_var::<u64>("REPORT_TIMEOUT_MS")? {
            config.report_timeout = std::time::Duration::from_millis(millis);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional environment variable, failing on unparseable values
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
