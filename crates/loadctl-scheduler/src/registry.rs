use chrono::Utc;
use tracing::{info, instrument};

use crate::db::{format_ts, SharedConnection};
use crate::error::{Result, SchedulerError};
use crate::schedule::parse_cron;
use crate::types::ScheduleConfig;

/// Initial values for a job's schedule row, used only when the row is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDefaults {
    pub cron: String,
    pub adjustment: i32,
    pub max_instances: u32,
    pub active: bool,
}

/// Partial edit applied by an operator. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub cron: Option<String>,
    pub adjustment: Option<i32>,
    pub max_instances: Option<u32>,
}

/// Durable table of one row per job: cron, date adjustment, cap, active flag.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ScheduleRegistry {
    conn: SharedConnection,
}

const SELECT_COLUMNS: &str =
    "SELECT name, cron, adjustment, max_instances, active, created_at, updated_at
     FROM schedule_config";

impl ScheduleRegistry {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Ensure a row exists for `name`.
    ///
    /// A missing row is created from `defaults`. An existing row is left
    /// exactly as the operator last set it, so edits survive restarts.
    #[instrument(skip(self, defaults))]
    pub fn register(&self, name: &str, defaults: &ScheduleDefaults) -> Result<ScheduleConfig> {
        validate(name, Some(&defaults.cron), Some(defaults.max_instances))?;
        let now = format_ts(Utc::now());
        {
            let db = self.conn.lock()?;
            let inserted = db.execute(
                "INSERT OR IGNORE INTO schedule_config
                 (name, cron, adjustment, max_instances, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    name,
                    defaults.cron,
                    defaults.adjustment,
                    defaults.max_instances,
                    defaults.active,
                    now
                ],
            )?;
            if inserted > 0 {
                info!(job = %name, cron = %defaults.cron, active = defaults.active, "schedule registered");
            }
        }
        self.get(name)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound {
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Result<Option<ScheduleConfig>> {
        let db = self.conn.lock()?;
        match db.query_row(
            &format!("{SELECT_COLUMNS} WHERE name = ?1"),
            [name],
            row_to_schedule,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// All rows ordered by name.
    pub fn list(&self) -> Result<Vec<ScheduleConfig>> {
        let db = self.conn.lock()?;
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt
            .query_map([], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All rows ordered by name, each decoded on its own.
    ///
    /// A row whose values do not fit the model (an out-of-range cap or
    /// adjustment written straight into the table) comes back as an error
    /// next to its name instead of failing the whole read.
    pub fn list_each(&self) -> Result<Vec<(String, Result<ScheduleConfig>)>> {
        let db = self.conn.lock()?;
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                Ok((name, row_to_schedule(row).map_err(SchedulerError::Database)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let now = format_ts(Utc::now());
        let db = self.conn.lock()?;
        let n = db.execute(
            "UPDATE schedule_config SET active = ?1, updated_at = ?2 WHERE name = ?3",
            rusqlite::params![active, now, name],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound {
                name: name.to_string(),
            });
        }
        info!(job = %name, active, "schedule active flag changed");
        Ok(())
    }

    /// Apply an operator edit. The cron expression and cap are validated
    /// before anything is written.
    #[instrument(skip(self))]
    pub fn update(&self, name: &str, update: &ScheduleUpdate) -> Result<ScheduleConfig> {
        validate(name, update.cron.as_deref(), update.max_instances)?;
        let now = format_ts(Utc::now());
        {
            let db = self.conn.lock()?;
            let n = db.execute(
                "UPDATE schedule_config
                 SET cron          = COALESCE(?1, cron),
                     adjustment    = COALESCE(?2, adjustment),
                     max_instances = COALESCE(?3, max_instances),
                     updated_at    = ?4
                 WHERE name = ?5",
                rusqlite::params![
                    update.cron,
                    update.adjustment,
                    update.max_instances,
                    now,
                    name
                ],
            )?;
            if n == 0 {
                return Err(SchedulerError::ScheduleNotFound {
                    name: name.to_string(),
                });
            }
        }
        self.get(name)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound {
                name: name.to_string(),
            })
    }

    /// Flip every active row to inactive in one transaction and return the
    /// names that were active (the resume set).
    #[instrument(skip(self))]
    pub fn deactivate_all(&self) -> Result<Vec<String>> {
        let now = format_ts(Utc::now());
        let mut db = self.conn.lock()?;
        let tx = db.transaction()?;
        let names = {
            let mut stmt =
                tx.prepare("SELECT name FROM schedule_config WHERE active = 1 ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };
        tx.execute(
            "UPDATE schedule_config SET active = 0, updated_at = ?1 WHERE active = 1",
            [&now],
        )?;
        tx.commit()?;
        info!(count = names.len(), "all active schedules deactivated");
        Ok(names)
    }

    /// Flip exactly `names` back to active. Unknown names are ignored.
    #[instrument(skip(self))]
    pub fn activate(&self, names: &[String]) -> Result<()> {
        let now = format_ts(Utc::now());
        let mut db = self.conn.lock()?;
        let tx = db.transaction()?;
        for name in names {
            tx.execute(
                "UPDATE schedule_config SET active = 1, updated_at = ?1 WHERE name = ?2",
                rusqlite::params![now, name],
            )?;
        }
        tx.commit()?;
        info!(count = names.len(), "schedules reactivated");
        Ok(())
    }
}

fn validate(name: &str, cron: Option<&str>, max_instances: Option<u32>) -> Result<()> {
    if let Some(expr) = cron {
        parse_cron(expr)?;
    }
    if max_instances == Some(0) {
        return Err(SchedulerError::InvalidSchedule {
            name: name.to_string(),
            reason: "max_instances must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleConfig> {
    Ok(ScheduleConfig {
        name: row.get(0)?,
        cron: row.get(1)?,
        adjustment: row.get(2)?,
        max_instances: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
