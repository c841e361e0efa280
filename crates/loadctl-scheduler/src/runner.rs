use std::time::Instant;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::loader::Loader;
use crate::store::LoadControlStore;
use crate::types::{LoadParams, RunOutcome};

/// Executes one (job, business date) unit with load-control bookkeeping.
///
/// Ordering within one invocation: the STARTED upsert completes before
/// `process` is called, and `process` returns before the DONE update.
#[derive(Clone)]
pub struct JobRunner {
    store: LoadControlStore,
}

impl JobRunner {
    pub fn new(store: LoadControlStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LoadControlStore {
        &self.store
    }

    /// Run `loader` for `business_date`.
    ///
    /// Loader errors are logged and reported as [`RunOutcome::Failed`]; the
    /// row stays STARTED so the sweeper can pick it up later. Only datastore
    /// errors come back as `Err`.
    #[instrument(
        skip(self, loader, extra),
        fields(job = %loader.process_name(), run_id = %Uuid::now_v7())
    )]
    pub async fn run(
        &self,
        loader: &dyn Loader,
        business_date: NaiveDate,
        match_date: NaiveDate,
        extra: Map<String, Value>,
        reprocess: bool,
    ) -> Result<RunOutcome> {
        let job = loader.process_name();
        let staged = (!extra.is_empty()).then(|| Value::Object(extra.clone()));
        self.store
            .upsert_started(job, business_date, match_date, staged.as_ref())?;

        let params = LoadParams {
            business_date,
            match_date,
            reprocess,
            extra,
        };
        let started = Instant::now();
        match loader.process(&params).await {
            Ok(payload) => {
                self.store
                    .mark_done(job, business_date, &payload, reprocess)?;
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "load completed"
                );
                Ok(RunOutcome::Done(payload))
            }
            Err(e) => {
                error!(
                    job = %job,
                    %business_date,
                    duration_ms = started.elapsed().as_millis() as u64,
                    err = %format!("{e:#}"),
                    "load failed; row left STARTED for reprocessing"
                );
                Ok(RunOutcome::Failed(format!("{e:#}")))
            }
        }
    }
}
