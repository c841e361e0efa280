use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of the schedule registry: how and whether a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Job name (primary key), matching the loader's process name.
    pub name: String,
    /// Five, six or seven field cron expression.
    pub cron: String,
    /// Scheduled occurrences to shift the business date by (sign = direction).
    pub adjustment: i32,
    /// Cap on concurrent executions of this job.
    pub max_instances: u32,
    pub active: bool,
    /// RFC 3339 timestamp of row creation.
    pub created_at: String,
    /// RFC 3339 timestamp of the last operator or coordinator edit.
    pub updated_at: String,
}

/// Lifecycle state of a load-control row.
///
/// There is no FAILED state: a failed run stays STARTED until the sweeper
/// picks it up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Started,
    Done,
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadStatus::Started => "started",
            LoadStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LoadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "started" => Ok(LoadStatus::Started),
            "done" => Ok(LoadStatus::Done),
            other => Err(format!("unknown load status: {other}")),
        }
    }
}

/// Durable bookkeeping for one (job, business date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadControlEntry {
    pub job_name: String,
    pub business_date: NaiveDate,
    /// Date of the tick that caused this row to exist.
    pub match_date: NaiveDate,
    pub status: LoadStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    /// Loader payload on DONE, or staged parameters (e.g. a restore target)
    /// while STARTED.
    pub result: Option<Value>,
}

impl LoadControlEntry {
    /// Parameters to hand back to the loader when this row is re-run.
    pub fn staged_params(&self) -> Map<String, Value> {
        match &self.result {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// What a loader receives for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    pub business_date: NaiveDate,
    pub match_date: NaiveDate,
    /// True when the sweeper, not a timer, triggered this run.
    pub reprocess: bool,
    /// Operation-specific parameters, flattened next to the dates.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of a single job-runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The loader returned; the row is DONE with this payload.
    Done(Value),
    /// The loader failed; the row was left STARTED.
    Failed(String),
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done(_))
    }
}

/// Point-in-time view of one job's timer, used for status and the stop log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub cron: String,
    pub adjustment: i32,
    pub max_instances: u32,
    pub active: bool,
    pub next_fire: Option<DateTime<Utc>>,
    pub running: u32,
}

/// Why the scheduler stopped, broadcast to the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReason {
    pub reason: String,
    /// Set when an error escaped the scheduler's own loops.
    pub fatal: bool,
}

impl StopReason {
    pub fn requested(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fatal: false,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fatal {
            write!(f, "fatal: {}", self.reason)
        } else {
            write!(f, "{}", self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_status_parses_stored_text() {
        assert_eq!("started".parse::<LoadStatus>(), Ok(LoadStatus::Started));
        assert_eq!("done".parse::<LoadStatus>(), Ok(LoadStatus::Done));
        assert!("failed".parse::<LoadStatus>().is_err());
    }

    #[test]
    fn load_params_flatten_extra_fields() {
        let mut extra = Map::new();
        extra.insert("target".to_string(), json!("2024-03-01.dump"));
        let params = LoadParams {
            business_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            match_date: NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
            reprocess: false,
            extra,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["business_date"], "2024-03-10");
        assert_eq!(value["target"], "2024-03-01.dump");
    }

    #[test]
    fn staged_params_ignore_non_object_payloads() {
        let entry = LoadControlEntry {
            job_name: "restore".to_string(),
            business_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            match_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            status: LoadStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            reprocessed_at: None,
            result: Some(json!(42)),
        };
        assert!(entry.staged_params().is_empty());
    }
}
