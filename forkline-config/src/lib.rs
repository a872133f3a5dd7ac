//! Configuration management for Forkline
//!
//! Configuration is split by domain (pool, logging), with validation,
//! defaults, YAML loading and environment variable overrides.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::PoolConfig,
    ForklineConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_ms;
