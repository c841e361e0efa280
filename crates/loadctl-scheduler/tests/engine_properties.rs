// End-to-end behaviour of the engine through its public API: crash recovery,
// instance caps, persisted operator edits and exclusive operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use loadctl_core::SchedulerConfig;
use loadctl_scheduler::{
    shared, LoadParams, LoadStatus, Loader, RunOutcome, ScheduleDefaults, ScheduleUpdate,
    Scheduler, SharedConnection,
};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

struct Flaky {
    name: String,
    exclusive: bool,
    failures_left: AtomicU32,
    calls: AtomicU32,
    seen: Mutex<Vec<LoadParams>>,
}

impl Flaky {
    fn new(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            exclusive: false,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn exclusive(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            exclusive: true,
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Loader for Flaky {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    async fn process(&self, params: &LoadParams) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(params.clone());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset");
        }
        Ok(json!({"inserted": 3}))
    }
}

fn daily(active: bool, cap: u32) -> ScheduleDefaults {
    ScheduleDefaults {
        cron: "0 0 * * *".to_string(),
        adjustment: -1,
        max_instances: cap,
        active,
    }
}

fn conn() -> SharedConnection {
    shared(Connection::open_in_memory().unwrap()).unwrap()
}

fn midnight(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn failed_run_is_reprocessed_exactly_once() {
    let sales = Flaky::new("sales", 1);
    let sched = Scheduler::builder(conn(), SchedulerConfig::default())
        .register_with(sales.clone(), daily(true, 1))
        .build()
        .unwrap();
    sched.reconcile().unwrap();

    let outcome = sched.fire("sales", midnight(10)).await.unwrap();
    assert!(matches!(outcome, Some(RunOutcome::Failed(_))));
    let row = sched.store().get("sales", date(9)).unwrap().unwrap();
    assert_eq!(row.status, LoadStatus::Started);

    // Too fresh for the sweep.
    let report = sched.sweep().await.unwrap();
    assert!(report.resubmitted.is_empty());

    let later = Utc::now() + chrono::Duration::minutes(31);
    let report = sched.sweep_at(later).await.unwrap();
    assert_eq!(report.resubmitted, vec![("sales".to_string(), date(9))]);
    settle().await;

    assert_eq!(sales.calls.load(Ordering::SeqCst), 2);
    let row = sched.store().get("sales", date(9)).unwrap().unwrap();
    assert_eq!(row.status, LoadStatus::Done);
    assert!(row.reprocessed_at.is_some());
    assert_eq!(row.match_date, date(10));

    let report = sched.sweep_at(later).await.unwrap();
    assert!(report.resubmitted.is_empty());
    settle().await;
    assert_eq!(sales.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn throttled_tick_is_staged_and_later_swept() {
    let sales = Flaky::new("sales", 0);
    let sched = Scheduler::builder(conn(), SchedulerConfig::default())
        .register_with(sales.clone(), daily(true, 1))
        .build()
        .unwrap();
    sched.reconcile().unwrap();

    let held = sched.counters().try_acquire("sales", 1).unwrap();
    assert!(sched.fire("sales", midnight(12)).await.unwrap().is_none());
    assert_eq!(sales.calls.load(Ordering::SeqCst), 0);

    let later = Utc::now() + chrono::Duration::hours(1);
    let report = sched.sweep_at(later).await.unwrap();
    assert!(report.resubmitted.is_empty());
    assert_eq!(report.deferred, 1);

    drop(held);
    let report = sched.sweep_at(later).await.unwrap();
    assert_eq!(report.resubmitted, vec![("sales".to_string(), date(11))]);
    settle().await;
    assert_eq!(sales.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        sched.store().get("sales", date(11)).unwrap().unwrap().status,
        LoadStatus::Done
    );
}

#[tokio::test]
async fn operator_edits_survive_a_rebuild() {
    let db = conn();
    let first = Scheduler::builder(db.clone(), SchedulerConfig::default())
        .register_with(Flaky::new("sales", 0), daily(false, 1))
        .build()
        .unwrap();
    first
        .registry()
        .update(
            "sales",
            &ScheduleUpdate {
                cron: Some("0 6 * * MON-FRI".to_string()),
                adjustment: Some(-2),
                max_instances: Some(3),
            },
        )
        .unwrap();
    first.registry().set_active("sales", true).unwrap();

    let second = Scheduler::builder(db, SchedulerConfig::default())
        .register_with(Flaky::new("sales", 0), daily(false, 1))
        .build()
        .unwrap();
    let row = second.registry().get("sales").unwrap().unwrap();
    assert_eq!(row.cron, "0 6 * * MON-FRI");
    assert_eq!(row.adjustment, -2);
    assert_eq!(row.max_instances, 3);
    assert!(row.active);

    second.reconcile().unwrap();
    let snap = second.snapshot().unwrap();
    assert_eq!(snap.len(), 1);
    assert!(snap[0].active);
    assert_eq!(snap[0].max_instances, 3);
}

#[tokio::test(start_paused = true)]
async fn exclusive_request_waits_for_running_jobs_then_resumes_them() {
    let restore = Flaky::exclusive("restore");
    let sales = Flaky::new("sales", 0);
    let audit = Flaky::new("audit", 0);
    let config = SchedulerConfig {
        drain_poll_secs: 1,
        ..SchedulerConfig::default()
    };
    let sched = Scheduler::builder(conn(), config)
        .register_with(restore.clone(), daily(true, 1))
        .register_with(sales.clone(), daily(true, 1))
        .register_with(audit.clone(), daily(false, 1))
        .build()
        .unwrap();
    sched.reconcile().unwrap();

    let running = sched.counters().try_acquire("sales", 1).unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        drop(running);
    });

    let mut params = Map::new();
    params.insert("target".to_string(), json!("dump-2024-03-09"));
    sched.request("restore", date(9), params).unwrap();

    let started = tokio::time::Instant::now();
    let report = sched.sweep().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(report.exclusive.as_deref(), Some("restore"));
    release.await.unwrap();

    assert_eq!(restore.calls.load(Ordering::SeqCst), 1);
    let seen = restore.seen.lock().unwrap().clone();
    assert!(seen[0].reprocess);
    assert_eq!(seen[0].extra.get("target"), Some(&json!("dump-2024-03-09")));

    let row = sched.store().get("restore", date(9)).unwrap().unwrap();
    assert_eq!(row.status, LoadStatus::Done);

    let active: Vec<String> = sched
        .registry()
        .list()
        .unwrap()
        .into_iter()
        .filter(|s| s.active)
        .map(|s| s.name)
        .collect();
    assert_eq!(active, vec!["restore", "sales"]);

    let snap = sched.snapshot().unwrap();
    let audit_snap = snap.iter().find(|j| j.name == "audit").unwrap();
    assert!(!audit_snap.active);
}
