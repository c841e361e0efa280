use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::Scheduler;
use crate::error::{Result, SchedulerError};
use crate::loader::Loader;
use crate::types::{LoadControlEntry, RunOutcome};

/// What one sweep tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// (job, business date) pairs handed back to the job runner.
    pub resubmitted: Vec<(String, NaiveDate)>,
    /// Stale rows left alone because their job was at its instance cap.
    pub deferred: usize,
    /// Exclusive job run this tick, if any. Scanning stops after it.
    pub exclusive: Option<String>,
}

impl Scheduler {
    /// One reprocessing pass as of the current time.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Resubmit STARTED rows older than the staleness threshold at `now`.
    ///
    /// Only jobs whose timer is active are scanned, oldest business date
    /// first, and only while the job has a free instance slot. Ordinary
    /// reprocess runs are spawned and hold their slot until they finish. A
    /// stale row of an exclusive loader that carries staged parameters is run
    /// inline behind a full drain, after which the tick ends.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let threshold = chrono::Duration::from_std(self.inner.config.reprocess_threshold())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - threshold;
        let mut report = SweepReport::default();

        for (name, cap) in self.active_jobs()? {
            let Ok(loader) = self.loader(&name) else {
                continue;
            };
            let stale = self.store().list_stale(&name, cutoff)?;
            if stale.is_empty() {
                continue;
            }
            debug!(job = %name, count = stale.len(), "stale load-control rows");

            for (idx, entry) in stale.iter().enumerate() {
                if loader.is_exclusive() && !entry.staged_params().is_empty() {
                    if self.run_exclusive(Arc::clone(&loader), entry).await? {
                        report.exclusive = Some(name);
                    }
                    return Ok(report);
                }

                let Some(guard) = self.inner.counters.try_acquire(&name, cap) else {
                    report.deferred += stale.len() - idx;
                    info!(
                        job = %name,
                        deferred = stale.len() - idx,
                        "job at instance cap; stale rows left for a later sweep"
                    );
                    break;
                };

                warn!(
                    job = %name,
                    business_date = %entry.business_date,
                    started_at = %entry.started_at,
                    "reprocessing stale load-control row"
                );
                report
                    .resubmitted
                    .push((name.clone(), entry.business_date));

                let runner = self.inner.runner.clone();
                let loader = Arc::clone(&loader);
                let entry = entry.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = runner
                        .run(
                            loader.as_ref(),
                            entry.business_date,
                            entry.match_date,
                            entry.staged_params(),
                            true,
                        )
                        .await
                    {
                        error!(
                            job = %entry.job_name,
                            business_date = %entry.business_date,
                            "reprocess run failed: {e}"
                        );
                    }
                });
            }
        }

        Ok(report)
    }

    /// Active timers with their current cap, ordered by name.
    fn active_jobs(&self) -> Result<Vec<(String, u32)>> {
        let timers = self.inner.timers.lock()?;
        let mut jobs: Vec<(String, u32)> = timers
            .iter()
            .filter(|(_, timer)| timer.is_active())
            .map(|(name, timer)| (name.clone(), timer.settings().max_instances))
            .collect();
        jobs.sort();
        Ok(jobs)
    }

    /// Drain everything, run the exclusive job alone, then resume exactly
    /// the schedules the drain switched off.
    ///
    /// Returns whether the exclusive job was actually invoked; `false` when
    /// the drain timed out or an instance was already running.
    async fn run_exclusive(&self, loader: Arc<dyn Loader>, entry: &LoadControlEntry) -> Result<bool> {
        let name = loader.process_name().to_string();
        info!(job = %name, business_date = %entry.business_date, "starting exclusive operation");

        let resume = match self.inner.coordinator.drain_and_deactivate_all(&name).await {
            Ok(resume) => resume,
            Err(SchedulerError::DrainTimeout { waited_secs, busy }) => {
                error!(job = %name, waited_secs, ?busy, "exclusive operation skipped; drain timed out");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.reconcile()?;

        let outcome = match self.inner.counters.try_acquire(&name, 1) {
            Some(guard) => {
                let outcome = self
                    .inner
                    .runner
                    .run(
                        loader.as_ref(),
                        entry.business_date,
                        entry.match_date,
                        entry.staged_params(),
                        true,
                    )
                    .await;
                drop(guard);
                Some(outcome)
            }
            None => {
                warn!(job = %name, "exclusive job already running; not starting another");
                None
            }
        };

        self.inner.coordinator.reactivate(&resume)?;
        self.reconcile()?;

        let Some(outcome) = outcome else {
            return Ok(false);
        };
        match outcome? {
            RunOutcome::Done(_) => info!(job = %name, "exclusive operation completed"),
            RunOutcome::Failed(e) => warn!(job = %name, "exclusive operation failed: {e}"),
        }
        Ok(true)
    }
}
