use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::{format_ts, parse_date, parse_ts, SharedConnection};
use crate::error::{Result, SchedulerError};
use crate::types::{LoadControlEntry, LoadStatus};

/// Durable one-row-per-(job, business date) lifecycle table.
#[derive(Clone)]
pub struct LoadControlStore {
    conn: SharedConnection,
}

const SELECT_COLUMNS: &str = "SELECT job_name, business_date, match_date, status, started_at,
            finished_at, reprocessed_at, result
     FROM load_control";

impl LoadControlStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Reset the row for (job, business date) to STARTED as of now.
    ///
    /// Always overwrites: `finished_at` and `reprocessed_at` are cleared and
    /// `result` becomes `params` (staged operation parameters or NULL).
    pub fn upsert_started(
        &self,
        job: &str,
        business_date: NaiveDate,
        match_date: NaiveDate,
        params: Option<&Value>,
    ) -> Result<()> {
        self.upsert_started_at(job, business_date, match_date, params, Utc::now())
    }

    /// [`Self::upsert_started`] with an explicit `started_at`.
    #[instrument(skip(self, params))]
    pub fn upsert_started_at(
        &self,
        job: &str,
        business_date: NaiveDate,
        match_date: NaiveDate,
        params: Option<&Value>,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = params.map(serde_json::to_string).transpose()?;
        let db = self.conn.lock()?;
        db.execute(
            "INSERT INTO load_control
             (job_name, business_date, match_date, status, started_at,
              finished_at, reprocessed_at, result)
             VALUES (?1, ?2, ?3, 'started', ?4, NULL, NULL, ?5)
             ON CONFLICT (job_name, business_date) DO UPDATE SET
                match_date     = excluded.match_date,
                status         = 'started',
                started_at     = excluded.started_at,
                finished_at    = NULL,
                reprocessed_at = NULL,
                result         = excluded.result",
            rusqlite::params![
                job,
                business_date.to_string(),
                match_date.to_string(),
                format_ts(started_at),
                result
            ],
        )?;
        debug!("load-control row started");
        Ok(())
    }

    /// Mark the row DONE with the loader's payload.
    #[instrument(skip(self, result))]
    pub fn mark_done(
        &self,
        job: &str,
        business_date: NaiveDate,
        result: &Value,
        reprocessed: bool,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        let payload = serde_json::to_string(result)?;
        let reprocessed_at = reprocessed.then(|| now.clone());
        let db = self.conn.lock()?;
        let n = db.execute(
            "UPDATE load_control
             SET status = 'done', finished_at = ?1, result = ?2,
                 reprocessed_at = COALESCE(?3, reprocessed_at)
             WHERE job_name = ?4 AND business_date = ?5",
            rusqlite::params![now, payload, reprocessed_at, job, business_date.to_string()],
        )?;
        if n == 0 {
            return Err(SchedulerError::CorruptRow(format!(
                "no load-control row for {job} / {business_date}"
            )));
        }
        debug!("load-control row done");
        Ok(())
    }

    pub fn get(&self, job: &str, business_date: NaiveDate) -> Result<Option<LoadControlEntry>> {
        let db = self.conn.lock()?;
        let raw = match db.query_row(
            &format!("{SELECT_COLUMNS} WHERE job_name = ?1 AND business_date = ?2"),
            rusqlite::params![job, business_date.to_string()],
            RawEntry::from_row,
        ) {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(SchedulerError::Database(e)),
        };
        raw.decode().map(Some)
    }

    /// Every row for `job`, oldest business date first.
    pub fn list_for_job(&self, job: &str) -> Result<Vec<LoadControlEntry>> {
        let db = self.conn.lock()?;
        let mut stmt = db.prepare(&format!(
            "{SELECT_COLUMNS} WHERE job_name = ?1 ORDER BY business_date"
        ))?;
        let rows = stmt
            .query_map([job], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    /// STARTED rows for `job` whose `started_at` is before `cutoff`, oldest
    /// business date first.
    pub fn list_stale(&self, job: &str, cutoff: DateTime<Utc>) -> Result<Vec<LoadControlEntry>> {
        let db = self.conn.lock()?;
        let mut stmt = db.prepare_cached(&format!(
            "{SELECT_COLUMNS}
             WHERE job_name = ?1 AND status = 'started' AND started_at < ?2
             ORDER BY business_date"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![job, format_ts(cutoff)], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawEntry::decode).collect()
    }
}

/// Row as stored, before text columns are parsed.
struct RawEntry {
    job_name: String,
    business_date: String,
    match_date: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    reprocessed_at: Option<String>,
    result: Option<String>,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_name: row.get(0)?,
            business_date: row.get(1)?,
            match_date: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            reprocessed_at: row.get(6)?,
            result: row.get(7)?,
        })
    }

    fn decode(self) -> Result<LoadControlEntry> {
        let status: LoadStatus = self.status.parse().map_err(SchedulerError::CorruptRow)?;
        Ok(LoadControlEntry {
            job_name: self.job_name,
            business_date: parse_date(&self.business_date)?,
            match_date: parse_date(&self.match_date)?,
            status,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            reprocessed_at: self.reprocessed_at.as_deref().map(parse_ts).transpose()?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::shared;
    use rusqlite::Connection;
    use serde_json::json;

    fn store() -> LoadControlStore {
        LoadControlStore::new(shared(Connection::open_in_memory().unwrap()).unwrap())
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn refiring_resets_the_single_row() {
        let store = store();
        store.upsert_started("sales", date(10), date(10), None).unwrap();
        store
            .mark_done("sales", date(10), &json!({"inserted": 5}), false)
            .unwrap();

        store.upsert_started("sales", date(10), date(11), None).unwrap();

        let rows = store.list_for_job("sales").unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.status, LoadStatus::Started);
        assert_eq!(row.match_date, date(11));
        assert!(row.finished_at.is_none());
        assert!(row.result.is_none());
    }

    #[test]
    fn mark_done_records_payload_and_reprocess_time() {
        let store = store();
        store.upsert_started("sales", date(10), date(10), None).unwrap();
        store
            .mark_done("sales", date(10), &json!({"inserted": 3, "deleted": 1}), true)
            .unwrap();

        let row = store.get("sales", date(10)).unwrap().unwrap();
        assert_eq!(row.status, LoadStatus::Done);
        assert!(row.finished_at.is_some());
        assert!(row.reprocessed_at.is_some());
        assert_eq!(row.result, Some(json!({"inserted": 3, "deleted": 1})));
    }

    #[test]
    fn mark_done_without_row_is_an_error() {
        let store = store();
        assert!(store.mark_done("sales", date(10), &json!({}), false).is_err());
    }

    #[test]
    fn list_stale_filters_by_age_and_status_and_orders_by_date() {
        let store = store();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);

        store.upsert_started_at("sales", date(12), date(12), None, old).unwrap();
        store.upsert_started_at("sales", date(10), date(10), None, old).unwrap();
        store.upsert_started_at("sales", date(11), date(11), None, now).unwrap();
        store.upsert_started_at("sales", date(9), date(9), None, old).unwrap();
        store.mark_done("sales", date(9), &json!({}), false).unwrap();
        store.upsert_started_at("other", date(10), date(10), None, old).unwrap();

        let cutoff = now - chrono::Duration::minutes(30);
        let stale: Vec<_> = store
            .list_stale("sales", cutoff)
            .unwrap()
            .into_iter()
            .map(|e| e.business_date)
            .collect();
        assert_eq!(stale, vec![date(10), date(12)]);
    }

    #[test]
    fn staged_params_survive_in_result() {
        let store = store();
        let params = json!({"target": "snapshot-0309"});
        store
            .upsert_started("restore", date(10), date(10), Some(&params))
            .unwrap();
        let row = store.get("restore", date(10)).unwrap().unwrap();
        assert_eq!(row.staged_params().get("target"), Some(&json!("snapshot-0309")));
    }
}
