use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// One SQLite connection shared by the registry, the store and the engine.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wrap an already-open connection, initialising the schema first.
pub fn shared(conn: Connection) -> Result<SharedConnection> {
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Initialise the engine schema in `conn`.
///
/// Creates the `schedule_config` registry and the `load_control` bookkeeping
/// table (both idempotent). The composite primary key on `load_control` is
/// what keeps one row per (job, business date); the secondary index serves
/// the sweeper's stale-entry query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_config (
            name           TEXT    NOT NULL PRIMARY KEY,
            cron           TEXT    NOT NULL,
            adjustment     INTEGER NOT NULL DEFAULT 0,
            max_instances  INTEGER NOT NULL DEFAULT 1 CHECK (max_instances >= 1),
            active         INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS load_control (
            job_name        TEXT NOT NULL,
            business_date   TEXT NOT NULL,   -- YYYY-MM-DD
            match_date      TEXT NOT NULL,   -- YYYY-MM-DD of the tick
            status          TEXT NOT NULL,   -- 'started' | 'done'
            started_at      TEXT NOT NULL,   -- RFC 3339
            finished_at     TEXT,
            reprocessed_at  TEXT,
            result          TEXT,            -- opaque JSON payload or NULL
            PRIMARY KEY (job_name, business_date)
        ) STRICT;

        -- Sweeper: WHERE job_name = ? AND status = 'started' AND started_at < ?
        CREATE INDEX IF NOT EXISTS idx_load_control_stale
            ON load_control (job_name, status, started_at);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 in UTC so stored timestamps compare correctly as text.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::CorruptRow(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| SchedulerError::CorruptRow(format!("bad date {raw:?}: {e}")))
}
