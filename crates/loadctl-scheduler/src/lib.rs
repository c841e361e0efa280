//! `loadctl-scheduler` — cron-driven load scheduling with SQLite load control.
//!
//! # Overview
//!
//! Each registered [`Loader`] gets a schedule row in `schedule_config`. The
//! [`Scheduler`] keeps one timer per active row, reconciling against the
//! table every few seconds, and records every (job, business date) it runs in
//! `load_control`. Rows left STARTED for too long are picked up again by the
//! reprocessing sweep.
//!
//! # Components
//!
//! | Component                | Role                                                   |
//! |--------------------------|--------------------------------------------------------|
//! | [`RetryPolicy`]          | Bounded retries with fixed, linear or exponential backoff |
//! | [`LoadControlStore`]     | Per (job, business date) STARTED / DONE ledger         |
//! | [`ScheduleRegistry`]     | Operator-editable cron, adjustment, cap, active flag   |
//! | [`JobRunner`]            | STARTED, then `process`, then DONE                     |
//! | [`Scheduler`]            | Timers, reconciliation, instance caps, stop            |
//! | `Scheduler::sweep`       | Resubmits stale STARTED rows                           |
//! | [`ExclusiveCoordinator`] | Drains every other job around an exclusive operation   |

pub mod coordinator;
pub mod counters;
pub mod db;
pub mod engine;
pub mod error;
pub mod loader;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod sweeper;
mod timer;
pub mod types;

pub use coordinator::ExclusiveCoordinator;
pub use counters::{InstanceCounters, InstanceGuard};
pub use db::{init_db, shared, SharedConnection};
pub use engine::{Scheduler, SchedulerBuilder};
pub use error::{Result, SchedulerError};
pub use loader::Loader;
pub use registry::{ScheduleDefaults, ScheduleRegistry, ScheduleUpdate};
pub use retry::{retry_action, RetryContext, RetryPolicy, RetryableAction};
pub use runner::JobRunner;
pub use store::LoadControlStore;
pub use sweeper::SweepReport;
pub use types::{
    JobSnapshot, LoadControlEntry, LoadParams, LoadStatus, RunOutcome, ScheduleConfig, StopReason,
};
