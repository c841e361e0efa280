use std::sync::Arc;

use dashmap::DashMap;

/// In-memory running-instance counts per job name.
///
/// Not persisted: a restart starts every count at zero and leaves STARTED
/// rows from the previous process to the sweeper's age check.
#[derive(Clone, Default)]
pub struct InstanceCounters {
    counts: Arc<DashMap<String, u32>>,
}

impl InstanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot for `job` if fewer than `cap` are in use.
    ///
    /// The check and the increment happen under the same shard lock. The
    /// slot is released when the returned guard is dropped, so it is freed
    /// exactly once whether the run succeeds, fails or panics.
    pub fn try_acquire(&self, job: &str, cap: u32) -> Option<InstanceGuard> {
        let mut count = self.counts.entry(job.to_string()).or_insert(0);
        if *count >= cap {
            return None;
        }
        *count += 1;
        Some(InstanceGuard {
            counts: Arc::clone(&self.counts),
            job: job.to_string(),
        })
    }

    pub fn running(&self, job: &str) -> u32 {
        self.counts.get(job).map(|c| *c).unwrap_or(0)
    }

    /// Jobs with at least one run in flight, excluding `except`.
    pub fn busy_except(&self, except: &str) -> Vec<String> {
        let mut busy: Vec<String> = self
            .counts
            .iter()
            .filter(|e| e.key() != except && *e.value() > 0)
            .map(|e| e.key().clone())
            .collect();
        busy.sort();
        busy
    }
}

/// One occupied slot in [`InstanceCounters`].
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct InstanceGuard {
    counts: Arc<DashMap<String, u32>>,
    job: String,
}

impl InstanceGuard {
    pub fn job(&self) -> &str {
        &self.job
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.job) {
            *count = count.saturating_sub(1);
        }
    }
}
