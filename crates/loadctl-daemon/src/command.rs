//! Loader that runs a configured shell command for each business date.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use loadctl_core::{JobConfig, RetryConfig};
use loadctl_scheduler::{retry_action, LoadParams, Loader, RetryPolicy, RetryableAction};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried into an attempt's error.
const MAX_STDERR_CHARS: usize = 2_000;

/// A `[[jobs]]` entry turned into a [`Loader`].
///
/// The command runs through `sh -c` with the run's parameters in its
/// environment:
///
/// | Variable                | Value                                   |
/// |-------------------------|-----------------------------------------|
/// | `LOADCTL_JOB`           | job name                                |
/// | `LOADCTL_BUSINESS_DATE` | `YYYY-MM-DD`                            |
/// | `LOADCTL_MATCH_DATE`    | `YYYY-MM-DD`                            |
/// | `LOADCTL_PARAMS`        | staged parameters as a JSON object      |
///
/// Every attempt is bounded by `timeout_secs` and a non-zero exit counts as
/// a failure, so both are retried by the configured policy.
pub struct CommandLoader {
    name: String,
    command: String,
    exclusive: bool,
    timeout: Option<Duration>,
    policy: RetryPolicy,
}

impl CommandLoader {
    pub fn new(job: &JobConfig, policy: RetryPolicy) -> Self {
        Self {
            name: job.name.clone(),
            command: job.command.clone(),
            exclusive: job.exclusive,
            timeout: job.timeout_secs.map(Duration::from_secs),
            policy,
        }
    }

    pub fn from_config(job: &JobConfig, retry: &RetryConfig) -> Self {
        Self::new(job, RetryPolicy::from(retry))
    }

    fn build_command(&self, params: &LoadParams) -> anyhow::Result<Command> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("LOADCTL_JOB", &self.name)
            .env("LOADCTL_BUSINESS_DATE", params.business_date.to_string())
            .env("LOADCTL_MATCH_DATE", params.match_date.to_string())
            .env("LOADCTL_PARAMS", serde_json::to_string(&params.extra)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl RetryableAction for CommandLoader {
    type Params = LoadParams;
    type Output = Value;

    async fn attempt(&self, params: LoadParams) -> anyhow::Result<Value> {
        debug!(job = %self.name, business_date = %params.business_date, "running command");
        let child = self.build_command(&params)?.spawn()?;

        // Dropping the wait future on timeout kills the child (kill_on_drop).
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => anyhow::bail!("command timed out after {}s", limit.as_secs()),
            },
            None => child.wait_with_output().await?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            anyhow::bail!("command exited with {exit_code}: {stderr}");
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(json!({ "exit_code": exit_code, "stdout": stdout }))
    }
}

#[async_trait]
impl Loader for CommandLoader {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    async fn process(&self, params: &LoadParams) -> anyhow::Result<Value> {
        retry_action(&self.policy, self, params.clone()).await
    }
}
