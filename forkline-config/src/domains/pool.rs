//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::validation::{Validatable, validate_optional_positive, validate_positive};
use crate::error::ConfigResult;

/// Worker pool configuration.
///
/// A pool copies this at construction; changing it afterwards has no effect
/// on a running pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes to fork
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs per Batch envelope; `None` picks a size from the job count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Carry the origin backtrace of handler errors back to the coordinator
    #[serde(default = "crate::domains::utils::default_false")]
    pub wrap_exceptions: bool,

    /// How long `close()` waits for worker reports
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_report_timeout")]
    pub report_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: None,
            wrap_exceptions: false,
            report_timeout: default_report_timeout(),
        }
    }
}

impl PoolConfig {
    /// Default configuration with a fixed number of workers
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn wrap_exceptions(mut self, wrap: bool) -> Self {
        self.wrap_exceptions = wrap;
        self
    }

    pub fn report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.worker_count, "worker_count", self.domain_name())?;
        validate_optional_positive(self.batch_size, "batch_size", self.domain_name())?;

        if self.report_timeout.is_zero() {
            return Err(self.validation_error("report_timeout must be greater than 0"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_report_timeout() -> Duration {
    Duration::from_secs(2)
}
