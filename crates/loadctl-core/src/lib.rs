//! `loadctl-core` — configuration and process-level errors shared by the
//! scheduler library and the daemon.

pub mod config;
pub mod error;

pub use config::{
    BackoffStrategy, DatabaseConfig, DrainTimeoutAction, JobConfig, LoadctlConfig, RetryConfig,
    SchedulerConfig,
};
pub use error::{LoadctlError, Result};
