use std::collections::HashSet;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{LoadctlError, Result};

pub const DEFAULT_MAIN_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REPROCESS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REPROCESS_THRESHOLD_SECS: u64 = 1800;
pub const DEFAULT_DRAIN_POLL_SECS: u64 = 5;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_CRON: &str = "0 0 * * *"; // daily at midnight
pub const DEFAULT_MAX_INSTANCES: u32 = 1;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 60_000;

/// Top-level config (loadctl.toml + LOADCTL_* env overrides).
///
/// Built once at startup and handed to every subsystem; nothing reads
/// process-wide globals after this point. Runtime-editable job settings live
/// in the schedule registry, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadctlConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Statically registered jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// What the exclusive-operation coordinator does when in-flight jobs never drain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DrainTimeoutAction {
    /// Reactivate the schedules that were switched off and fail the exclusive run.
    #[default]
    Abort,
    /// Log the stragglers and let the exclusive job run anyway.
    Proceed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reconciliation cadence against the schedule registry.
    #[serde(default = "default_main_interval")]
    pub main_interval_secs: u64,
    /// Cadence of the stale-entry sweep.
    #[serde(default = "default_reprocess_interval")]
    pub reprocess_interval_secs: u64,
    /// Age after which a STARTED load-control row is considered stuck.
    #[serde(default = "default_reprocess_threshold")]
    pub reprocess_threshold_secs: u64,
    #[serde(default = "default_drain_poll")]
    pub drain_poll_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default)]
    pub on_drain_timeout: DrainTimeoutAction,
    #[serde(default = "default_cron")]
    pub default_cron: String,
    #[serde(default)]
    pub default_adjustment: i32,
    #[serde(default = "default_max_instances")]
    pub default_max_instances: u32,
    /// Whether rows created at registration start out active.
    #[serde(default)]
    pub activate_on_register: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            main_interval_secs: DEFAULT_MAIN_INTERVAL_SECS,
            reprocess_interval_secs: DEFAULT_REPROCESS_INTERVAL_SECS,
            reprocess_threshold_secs: DEFAULT_REPROCESS_THRESHOLD_SECS,
            drain_poll_secs: DEFAULT_DRAIN_POLL_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            on_drain_timeout: DrainTimeoutAction::default(),
            default_cron: DEFAULT_CRON.to_string(),
            default_adjustment: 0,
            default_max_instances: DEFAULT_MAX_INSTANCES,
            activate_on_register: false,
        }
    }
}

impl SchedulerConfig {
    pub fn main_interval(&self) -> Duration {
        Duration::from_secs(self.main_interval_secs.max(1))
    }

    pub fn reprocess_interval(&self) -> Duration {
        Duration::from_secs(self.reprocess_interval_secs.max(1))
    }

    pub fn reprocess_threshold(&self) -> Duration {
        Duration::from_secs(self.reprocess_threshold_secs)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_secs(self.drain_poll_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Backoff unit in milliseconds.
    #[serde(default = "default_retry_backoff")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_retry_max_backoff")]
    pub max_backoff_ms: u64,
    /// Randomise each delay within `[0, delay]` so loaders hitting the same
    /// endpoint do not retry in lockstep.
    #[serde(default = "bool_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            strategy: BackoffStrategy::default(),
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            jitter: true,
        }
    }
}

/// A statically registered job, executed by the daemon's command loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Shell command run through `sh -c` for every (job, business date).
    pub command: String,
    /// Initial cron expression; falls back to `scheduler.default_cron`.
    pub cron: Option<String>,
    pub adjustment: Option<i32>,
    pub max_instances: Option<u32>,
    /// Marks the restore-kind job that must run with everything else drained.
    #[serde(default)]
    pub exclusive: bool,
    /// Per-attempt wall-clock limit for the command.
    pub timeout_secs: Option<u64>,
}

fn bool_true() -> bool {
    true
}
fn default_main_interval() -> u64 {
    DEFAULT_MAIN_INTERVAL_SECS
}
fn default_reprocess_interval() -> u64 {
    DEFAULT_REPROCESS_INTERVAL_SECS
}
fn default_reprocess_threshold() -> u64 {
    DEFAULT_REPROCESS_THRESHOLD_SECS
}
fn default_drain_poll() -> u64 {
    DEFAULT_DRAIN_POLL_SECS
}
fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_cron() -> String {
    DEFAULT_CRON.to_string()
}
fn default_max_instances() -> u32 {
    DEFAULT_MAX_INSTANCES
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_retry_backoff() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
fn default_retry_max_backoff() -> u64 {
    DEFAULT_RETRY_MAX_BACKOFF_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.loadctl/loadctl.db", home)
}

impl LoadctlConfig {
    /// Load config from a TOML file with LOADCTL_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore because field names
    /// contain single ones: `LOADCTL_SCHEDULER__MAIN_INTERVAL_SECS=10`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("LOADCTL_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: LoadctlConfig = figment
            .extract()
            .map_err(|e| LoadctlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.default_max_instances == 0 {
            return Err(LoadctlError::Config(
                "scheduler.default_max_instances must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(LoadctlError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(LoadctlError::Config("job name must not be empty".to_string()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(LoadctlError::Config(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
            if job.max_instances == Some(0) {
                return Err(LoadctlError::Config(format!(
                    "job {}: max_instances must be at least 1",
                    job.name
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.loadctl/loadctl.toml", home)
}
