//! Logging setup for Forkline
//!
//! Library code logs through `tracing`; binaries embedding a pool call one
//! of the initialisers here once at startup. Forked workers inherit the
//! subscriber installed in the coordinator.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
