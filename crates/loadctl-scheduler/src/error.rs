use thiserror::Error;

/// Errors that can occur within the scheduling engine.
///
/// Loader failures are not represented here: the job runner catches them and
/// leaves the load-control row STARTED for the sweeper.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The shared connection mutex was poisoned by a panicking holder.
    #[error("Database connection lock poisoned")]
    LockPoisoned,

    /// The cron expression could not be parsed.
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A schedule attribute is out of range (e.g. max_instances = 0).
    #[error("Invalid schedule for {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    /// No schedule row exists for the job.
    #[error("Schedule not found: {name}")]
    ScheduleNotFound { name: String },

    /// No loader is registered under this name.
    #[error("Unknown job: {name}")]
    UnknownJob { name: String },

    /// In-flight executions did not finish before the drain deadline.
    #[error("Drain timed out after {waited_secs}s; still running: {busy:?}")]
    DrainTimeout { waited_secs: u64, busy: Vec<String> },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded (bad date, unknown status, ...).
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Scheduler already started")]
    AlreadyStarted,
}

impl<T> From<std::sync::PoisonError<T>> for SchedulerError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SchedulerError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
