use std::time::Duration;

use loadctl_core::{DrainTimeoutAction, SchedulerConfig};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::counters::InstanceCounters;
use crate::error::{Result, SchedulerError};
use crate::registry::ScheduleRegistry;

/// Quiesces every other job so an exclusive operation (full restore) can
/// run alone, then resumes exactly what it switched off.
#[derive(Clone)]
pub struct ExclusiveCoordinator {
    registry: ScheduleRegistry,
    counters: InstanceCounters,
    poll: Duration,
    timeout: Duration,
    on_timeout: DrainTimeoutAction,
}

impl ExclusiveCoordinator {
    pub fn new(
        registry: ScheduleRegistry,
        counters: InstanceCounters,
        poll: Duration,
        timeout: Duration,
        on_timeout: DrainTimeoutAction,
    ) -> Self {
        Self {
            registry,
            counters,
            poll,
            timeout,
            on_timeout,
        }
    }

    pub fn from_config(
        registry: ScheduleRegistry,
        counters: InstanceCounters,
        config: &SchedulerConfig,
    ) -> Self {
        Self::new(
            registry,
            counters,
            config.drain_poll(),
            config.drain_timeout(),
            config.on_drain_timeout,
        )
    }

    /// Deactivate every active schedule, then wait until no job other than
    /// `exclusive_job` has a run in flight.
    ///
    /// Returns the names that were active (the resume set). On timeout the
    /// configured action decides: `Abort` reactivates the resume set and
    /// returns [`SchedulerError::DrainTimeout`]; `Proceed` logs the
    /// stragglers and returns the resume set anyway.
    #[instrument(skip(self))]
    pub async fn drain_and_deactivate_all(&self, exclusive_job: &str) -> Result<Vec<String>> {
        let resume = self.registry.deactivate_all()?;
        info!(deactivated = ?resume, "draining for exclusive operation");

        let started = Instant::now();
        loop {
            let busy = self.counters.busy_except(exclusive_job);
            if busy.is_empty() {
                info!(waited_ms = started.elapsed().as_millis() as u64, "drain complete");
                return Ok(resume);
            }

            if started.elapsed() >= self.timeout {
                let waited_secs = started.elapsed().as_secs();
                return match self.on_timeout {
                    DrainTimeoutAction::Abort => {
                        error!(?busy, waited_secs, "drain timed out; aborting exclusive operation");
                        self.registry.activate(&resume)?;
                        Err(SchedulerError::DrainTimeout { waited_secs, busy })
                    }
                    DrainTimeoutAction::Proceed => {
                        warn!(?busy, waited_secs, "drain timed out; proceeding with jobs still running");
                        Ok(resume)
                    }
                };
            }

            info!(?busy, "waiting for in-flight jobs to finish");
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Flip exactly `names` back to active.
    pub fn reactivate(&self, names: &[String]) -> Result<()> {
        self.registry.activate(names)?;
        info!(reactivated = ?names, "exclusive operation finished; schedules resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::shared;
    use crate::registry::ScheduleDefaults;
    use rusqlite::Connection;

    fn setup(on_timeout: DrainTimeoutAction) -> (ExclusiveCoordinator, ScheduleRegistry, InstanceCounters) {
        let registry = ScheduleRegistry::new(shared(Connection::open_in_memory().unwrap()).unwrap());
        for (name, active) in [("a", true), ("b", true), ("c", false), ("restore", true)] {
            registry
                .register(
                    name,
                    &ScheduleDefaults {
                        cron: "0 0 * * *".to_string(),
                        adjustment: 0,
                        max_instances: 1,
                        active,
                    },
                )
                .unwrap();
        }
        let counters = InstanceCounters::new();
        let coordinator = ExclusiveCoordinator::new(
            registry.clone(),
            counters.clone(),
            Duration::from_secs(5),
            Duration::from_secs(60),
            on_timeout,
        );
        (coordinator, registry, counters)
    }

    fn active_names(registry: &ScheduleRegistry) -> Vec<String> {
        registry
            .list()
            .unwrap()
            .into_iter()
            .filter(|s| s.active)
            .map(|s| s.name)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_previously_active_and_reactivate_restores_them() {
        let (coordinator, registry, _counters) = setup(DrainTimeoutAction::Abort);

        let resume = coordinator.drain_and_deactivate_all("restore").await.unwrap();
        assert_eq!(resume, vec!["a", "b", "restore"]);
        assert!(active_names(&registry).is_empty());

        coordinator.reactivate(&resume).unwrap();
        assert_eq!(active_names(&registry), vec!["a", "b", "restore"]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_running_jobs_but_not_the_exclusive_one() {
        let (coordinator, _registry, counters) = setup(DrainTimeoutAction::Abort);
        let _restore = counters.try_acquire("restore", 1).unwrap();
        let running = counters.try_acquire("a", 1).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            drop(running);
        });

        let started = Instant::now();
        let resume = coordinator.drain_and_deactivate_all("restore").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(12));
        assert_eq!(resume.len(), 3);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abort_on_timeout_reactivates_and_errors() {
        let (coordinator, registry, counters) = setup(DrainTimeoutAction::Abort);
        let _stuck = counters.try_acquire("b", 1).unwrap();

        let err = coordinator.drain_and_deactivate_all("restore").await.unwrap_err();
        match err {
            SchedulerError::DrainTimeout { busy, .. } => assert_eq!(busy, vec!["b"]),
            other => panic!("expected DrainTimeout, got {other:?}"),
        }
        assert_eq!(active_names(&registry), vec!["a", "b", "restore"]);
    }

    #[tokio::test(start_paused = true)]
    async fn proceed_on_timeout_keeps_schedules_off() {
        let (coordinator, registry, counters) = setup(DrainTimeoutAction::Proceed);
        let _stuck = counters.try_acquire("b", 1).unwrap();

        let resume = coordinator.drain_and_deactivate_all("restore").await.unwrap();
        assert_eq!(resume, vec!["a", "b", "restore"]);
        assert!(active_names(&registry).is_empty());
    }
}
