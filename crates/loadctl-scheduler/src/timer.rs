use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Scheduler;
use crate::schedule::next_fire;

/// Live settings of one job's timer, replaced in place on reconciliation.
#[derive(Debug, Clone)]
pub(crate) struct TimerSettings {
    pub cron: String,
    pub schedule: Schedule,
    pub adjustment: i32,
    pub max_instances: u32,
}

impl TimerSettings {
    pub(crate) fn same_settings(&self, other: &TimerSettings) -> bool {
        self.cron == other.cron
            && self.adjustment == other.adjustment
            && self.max_instances == other.max_instances
    }
}

/// One job's timer: its current settings and, while active, the firing task.
pub(crate) struct JobTimer {
    settings_tx: watch::Sender<TimerSettings>,
    cancel: Option<CancellationToken>,
}

impl JobTimer {
    pub(crate) fn new(settings: TimerSettings) -> Self {
        let (settings_tx, _) = watch::channel(settings);
        Self {
            settings_tx,
            cancel: None,
        }
    }

    pub(crate) fn settings(&self) -> TimerSettings {
        self.settings_tx.borrow().clone()
    }

    /// Swap in new settings. A running task picks them up at its next wait
    /// without losing its active state.
    pub(crate) fn update(&self, settings: TimerSettings) {
        self.settings_tx.send_replace(settings);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub(crate) fn next_fire(&self) -> Option<DateTime<Utc>> {
        if !self.is_active() {
            return None;
        }
        next_fire(&self.settings_tx.borrow().schedule, Utc::now())
    }

    /// Spawn the firing task. The task also stops when `shutdown` is cancelled.
    pub(crate) fn start(&mut self, scheduler: Scheduler, name: String, shutdown: &CancellationToken) {
        if self.is_active() {
            return;
        }
        let cancel = shutdown.child_token();
        self.cancel = Some(cancel.clone());
        let settings_rx = self.settings_tx.subscribe();
        tokio::spawn(run_timer(scheduler, name, settings_rx, cancel));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First occurrence after both the previous tick and `now`. A tick is never
/// handed out twice, even when the wall clock still reads earlier than the
/// last scheduled instant.
pub(crate) fn next_tick(
    schedule: &Schedule,
    last_tick: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let from = match last_tick {
        Some(last) => last.max(now),
        None => now,
    };
    next_fire(schedule, from)
}

/// Sleep until each scheduled instant and hand it to [`Scheduler::fire`].
///
/// The scheduled instant, not the wake-up time, is passed on as the tick so
/// business-date arithmetic lands on the cron grid.
async fn run_timer(
    scheduler: Scheduler,
    name: String,
    mut settings_rx: watch::Receiver<TimerSettings>,
    cancel: CancellationToken,
) {
    info!(job = %name, "job timer started");
    let mut last_tick: Option<DateTime<Utc>> = None;

    loop {
        let schedule = settings_rx.borrow_and_update().schedule.clone();

        let Some(tick) = next_tick(&schedule, last_tick, Utc::now()) else {
            warn!(job = %name, "cron expression has no future occurrences");
            let done = tokio::select! {
                _ = cancel.cancelled() => true,
                changed = settings_rx.changed() => changed.is_err(),
            };
            if done {
                break;
            }
            continue;
        };

        let wait = (tick - Utc::now()).to_std().unwrap_or_default();
        debug!(job = %name, next = %tick, "job timer waiting");

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                debug!(job = %name, "job timer settings changed");
            }
            _ = tokio::time::sleep(wait) => {
                last_tick = Some(tick);
                let scheduler = scheduler.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.fire(&name, tick).await {
                        error!(job = %name, %tick, "firing failed: {e}");
                    }
                });
            }
        }
    }

    info!(job = %name, "job timer stopped");
}
