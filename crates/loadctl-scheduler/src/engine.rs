use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use loadctl_core::{LoadctlConfig, SchedulerConfig};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::ExclusiveCoordinator;
use crate::counters::InstanceCounters;
use crate::db::SharedConnection;
use crate::error::{Result, SchedulerError};
use crate::loader::Loader;
use crate::registry::{ScheduleDefaults, ScheduleRegistry};
use crate::runner::JobRunner;
use crate::schedule::{business_date as resolve_business_date, parse_cron};
use crate::store::LoadControlStore;
use crate::timer::{JobTimer, TimerSettings};
use crate::types::{JobSnapshot, RunOutcome, StopReason};

/// Collects loaders and their initial schedule values before the engine starts.
pub struct SchedulerBuilder {
    conn: SharedConnection,
    config: SchedulerConfig,
    jobs: Vec<(Arc<dyn Loader>, ScheduleDefaults)>,
}

impl SchedulerBuilder {
    pub fn new(conn: SharedConnection, config: SchedulerConfig) -> Self {
        Self {
            conn,
            config,
            jobs: Vec::new(),
        }
    }

    /// Defaults a job gets when its schedule row does not exist yet.
    pub fn default_schedule(&self) -> ScheduleDefaults {
        ScheduleDefaults {
            cron: self.config.default_cron.clone(),
            adjustment: self.config.default_adjustment,
            max_instances: self.config.default_max_instances,
            active: self.config.activate_on_register,
        }
    }

    /// Register `loader` with the configured defaults.
    pub fn register(self, loader: Arc<dyn Loader>) -> Self {
        let defaults = self.default_schedule();
        self.register_with(loader, defaults)
    }

    pub fn register_with(mut self, loader: Arc<dyn Loader>, defaults: ScheduleDefaults) -> Self {
        self.jobs.push((loader, defaults));
        self
    }

    /// Write a schedule row for every registered job (existing rows are kept)
    /// and assemble the engine. Nothing fires until [`Scheduler::start`].
    pub fn build(self) -> Result<Scheduler> {
        let registry = ScheduleRegistry::new(Arc::clone(&self.conn));
        let store = LoadControlStore::new(Arc::clone(&self.conn));
        let counters = InstanceCounters::new();

        let mut loaders = HashMap::new();
        for (loader, defaults) in self.jobs {
            let name = loader.process_name().to_string();
            registry.register(&name, &defaults)?;
            if loaders.insert(name.clone(), loader).is_some() {
                warn!(job = %name, "loader registered twice; keeping the last one");
            }
        }

        let coordinator =
            ExclusiveCoordinator::from_config(registry.clone(), counters.clone(), &self.config);
        let (stopped_tx, _) = watch::channel(None);

        info!(jobs = loaders.len(), "scheduler built");
        Ok(Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                runner: JobRunner::new(store),
                counters,
                coordinator,
                loaders,
                timers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stopped_tx,
            }),
        })
    }
}

pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    pub(crate) registry: ScheduleRegistry,
    pub(crate) runner: JobRunner,
    pub(crate) counters: InstanceCounters,
    pub(crate) coordinator: ExclusiveCoordinator,
    pub(crate) loaders: HashMap<String, Arc<dyn Loader>>,
    pub(crate) timers: Mutex<HashMap<String, JobTimer>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopping: AtomicBool,
    stopped_tx: watch::Sender<Option<StopReason>>,
}

/// The scheduling engine: one timer per job, reconciled against the
/// schedule registry, plus the reprocessing sweeper.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(conn: SharedConnection, config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(conn, config)
    }

    /// Builder seeded from the full process config.
    pub fn builder_from(conn: SharedConnection, config: &LoadctlConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(conn, config.scheduler.clone())
    }

    pub fn registry(&self) -> &ScheduleRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &LoadControlStore {
        self.inner.runner.store()
    }

    pub fn coordinator(&self) -> &ExclusiveCoordinator {
        &self.inner.coordinator
    }

    pub fn counters(&self) -> &InstanceCounters {
        &self.inner.counters
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub(crate) fn loader(&self, name: &str) -> Result<Arc<dyn Loader>> {
        self.inner
            .loaders
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob {
                name: name.to_string(),
            })
    }

    /// Start the reconciliation loop and the reprocessing sweep.
    ///
    /// Job timers are started by the first reconciliation, which runs before
    /// this returns. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.reconcile()?;

        let main = self.clone();
        tokio::spawn(async move { main.reconcile_loop().await });
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });

        info!(
            main_interval_secs = self.inner.config.main_interval_secs,
            reprocess_interval_secs = self.inner.config.reprocess_interval_secs,
            "scheduler started"
        );
        Ok(())
    }

    async fn reconcile_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.main_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile() {
                        error!("reconciliation failed: {e}");
                        self.stop(StopReason::fatal(format!("reconciliation failed: {e}")));
                        break;
                    }
                }
                _ = self.inner.shutdown.cancelled() => break,
            }
        }
        debug!("reconciliation loop exited");
    }

    async fn sweep_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.reprocess_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("reprocessing sweep failed: {e}");
                        self.stop(StopReason::fatal(format!("reprocessing sweep failed: {e}")));
                        break;
                    }
                }
                _ = self.inner.shutdown.cancelled() => break,
            }
        }
        debug!("sweep loop exited");
    }

    /// Bring the in-memory timers in line with the schedule registry.
    ///
    /// Changed cron/adjustment/cap values are pushed into the live timer
    /// without touching its active state; the active flag then starts or
    /// stops it. Rows that cannot be decoded or carry an unparseable cron are
    /// logged and skipped, and a timer that is already running keeps its last
    /// valid settings. A timer whose row has disappeared is stopped and
    /// dropped.
    pub fn reconcile(&self) -> Result<()> {
        let rows = self.inner.registry.list_each()?;
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        let mut timers = self.inner.timers.lock()?;
        let mut seen = HashSet::new();

        for (name, row) in rows {
            if !self.inner.loaders.contains_key(&name) {
                debug!(job = %name, "schedule row without a registered loader");
                continue;
            }
            seen.insert(name.clone());
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    error!(job = %name, "skipping undecodable schedule row: {e}");
                    continue;
                }
            };
            let schedule = match parse_cron(&row.cron) {
                Ok(s) => s,
                Err(e) => {
                    error!(job = %row.name, "skipping schedule: {e}");
                    continue;
                }
            };
            let settings = TimerSettings {
                cron: row.cron.clone(),
                schedule,
                adjustment: row.adjustment,
                max_instances: row.max_instances,
            };

            let timer = timers
                .entry(row.name.clone())
                .or_insert_with(|| JobTimer::new(settings.clone()));
            if !timer.settings().same_settings(&settings) {
                info!(
                    job = %row.name,
                    cron = %settings.cron,
                    adjustment = settings.adjustment,
                    max_instances = settings.max_instances,
                    "schedule settings changed"
                );
                timer.update(settings);
            }

            match (timer.is_active(), row.active) {
                (false, true) => {
                    timer.start(self.clone(), row.name.clone(), &self.inner.shutdown);
                    info!(job = %row.name, "job timer activated");
                }
                (true, false) => {
                    timer.stop();
                    info!(job = %row.name, "job timer deactivated");
                }
                _ => {}
            }
        }

        timers.retain(|name, timer| {
            if seen.contains(name) {
                return true;
            }
            if timer.is_active() {
                error!(job = %name, "schedule row missing; job timer stopped");
            }
            false
        });
        Ok(())
    }

    /// Handle one scheduled tick of `name`.
    ///
    /// Returns `None` when nothing was executed: the job is inactive, the
    /// business date could not be computed, or the job was at its instance
    /// cap (in which case a STARTED row is staged for the sweeper).
    pub async fn fire(&self, name: &str, tick: DateTime<Utc>) -> Result<Option<RunOutcome>> {
        let loader = self.loader(name)?;
        let row = self
            .inner
            .registry
            .get(name)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound {
                name: name.to_string(),
            })?;
        if !row.active {
            debug!(job = %name, %tick, "tick ignored; job inactive");
            return Ok(None);
        }

        let schedule = parse_cron(&row.cron)?;
        let match_date = tick.date_naive();
        let Some(business_date) = resolve_business_date(&schedule, tick, row.adjustment) else {
            warn!(job = %name, %tick, adjustment = row.adjustment, "no business date for tick");
            return Ok(None);
        };

        let Some(guard) = self.inner.counters.try_acquire(name, row.max_instances) else {
            self.store()
                .upsert_started(name, business_date, match_date, None)?;
            warn!(
                job = %name,
                %business_date,
                max_instances = row.max_instances,
                "job at instance cap; business date staged for reprocessing"
            );
            return Ok(None);
        };
        // A drain may have switched the job off between the read above and
        // taking the slot; the coordinator only waits for slots it can see.
        if !self.inner.registry.get(name)?.is_some_and(|r| r.active) {
            drop(guard);
            debug!(job = %name, %tick, "tick dropped; job deactivated while taking a slot");
            return Ok(None);
        }

        info!(job = %name, %business_date, %match_date, "job firing");
        let outcome = self
            .inner
            .runner
            .run(loader.as_ref(), business_date, match_date, Map::new(), false)
            .await;
        drop(guard);
        outcome.map(Some)
    }

    /// Stage a run of `name` for `business_date` with operation parameters
    /// (e.g. a restore target). The row is backdated past the staleness
    /// threshold so the next sweep picks it up.
    pub fn request(&self, name: &str, business_date: NaiveDate, params: Map<String, Value>) -> Result<()> {
        self.loader(name)?;
        let threshold = chrono::Duration::from_std(self.inner.config.reprocess_threshold())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let started_at = now - threshold - chrono::Duration::seconds(1);
        let staged = (!params.is_empty()).then(|| Value::Object(params));
        self.store().upsert_started_at(
            name,
            business_date,
            now.date_naive(),
            staged.as_ref(),
            started_at,
        )?;
        info!(job = %name, %business_date, "run requested");
        Ok(())
    }

    /// Per-job view of timers and running counts, ordered by job name.
    pub fn snapshot(&self) -> Result<Vec<JobSnapshot>> {
        let timers = self.inner.timers.lock()?;
        let mut out: Vec<JobSnapshot> = timers
            .iter()
            .map(|(name, timer)| {
                let settings = timer.settings();
                JobSnapshot {
                    name: name.clone(),
                    cron: settings.cron,
                    adjustment: settings.adjustment,
                    max_instances: settings.max_instances,
                    active: timer.is_active(),
                    next_fire: timer.next_fire(),
                    running: self.inner.counters.running(name),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Stop every timer and both loops, log a snapshot, and broadcast the
    /// stopped event. In-flight runs are not cancelled. Idempotent: only the
    /// first reason is kept.
    pub fn stop(&self, reason: StopReason) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.snapshot() {
            Ok(jobs) => {
                for job in jobs {
                    info!(
                        job = %job.name,
                        cron = %job.cron,
                        adjustment = job.adjustment,
                        max_instances = job.max_instances,
                        next_fire = ?job.next_fire,
                        running = job.running,
                        "job state at stop"
                    );
                }
            }
            Err(e) => warn!("could not snapshot jobs at stop: {e}"),
        }

        self.inner.shutdown.cancel();
        match self.inner.timers.lock() {
            Ok(mut timers) => timers.values_mut().for_each(JobTimer::stop),
            Err(e) => warn!("timer map poisoned at stop: {e}"),
        }

        if reason.fatal {
            error!(%reason, "scheduler stopped");
        } else {
            info!(%reason, "scheduler stopped");
        }
        self.inner.stopped_tx.send_replace(Some(reason));
    }

    /// Receiver for the stopped event; holds `None` until [`Self::stop`].
    pub fn stopped(&self) -> watch::Receiver<Option<StopReason>> {
        self.inner.stopped_tx.subscribe()
    }

    /// Wait until the scheduler has stopped and return why.
    pub async fn wait_stopped(&self) -> StopReason {
        let mut rx = self.stopped();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::fatal("stopped channel closed");
            }
        }
    }
}
