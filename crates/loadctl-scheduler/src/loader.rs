use async_trait::async_trait;
use serde_json::Value;

use crate::types::LoadParams;

/// One job's data-loading logic. The engine only ever sees this contract.
///
/// Implementations may use [`crate::retry::RetryPolicy`] internally for the
/// individual steps they want retried; an error returned from `process` is
/// logged by the job runner and leaves the load-control row STARTED.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Job name; also the key of the job's schedule row.
    fn process_name(&self) -> &str;

    /// Whether this loader is an exclusive operation (e.g. a full restore)
    /// that must run with every other job drained.
    fn is_exclusive(&self) -> bool {
        false
    }

    /// Execute the job for `params.business_date`. The returned payload is
    /// stored as the row's result (e.g. inserted/deleted counts).
    async fn process(&self, params: &LoadParams) -> anyhow::Result<Value>;
}
