//! Daily ingestion pipeline: paginate the ratings registry, diff against
//! the store, record rating transitions, and bulk-upsert — tolerating
//! partial failure from either side without halting the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hfx_core::{RunTotals, RunType};
use hfx_registry::{RegistryError, RegistrySource};
use hfx_storage::{EstablishmentStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hfx-pipeline";

mod detect;
mod mapper;
#[cfg(test)]
pub(crate) mod testing;

pub use detect::{detect_rating_changes, upsert_in_batches};
pub use mapper::map_establishment;

/// Registry page size; 200 is reliable without upstream timeouts.
pub const PAGE_SIZE: u32 = 200;
/// Hard ceiling on pages per run, in case upstream pagination metadata is
/// wrong or unbounded.
pub const MAX_PAGES: u32 = 500;
/// Rows per upsert call, to stay under store payload limits.
pub const UPSERT_BATCH_SIZE: usize = 100;
/// Pause between registry page fetches.
pub const PAGE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fetch establishments rated at or below this tier. 0 is valid and
    /// means the worst tier only.
    pub max_rating: u8,
    /// Fetch and count, but never write and never create a run record.
    pub dry_run: bool,
    pub page_size: u32,
    pub max_pages: u32,
    pub upsert_batch_size: usize,
    pub page_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rating: 2,
            dry_run: false,
            page_size: PAGE_SIZE,
            max_pages: MAX_PAGES,
            upsert_batch_size: UPSERT_BATCH_SIZE,
            page_delay: PAGE_DELAY,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            max_rating: std::env::var("HFX_MAX_RATING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            ..Self::default()
        }
    }
}

/// Classified pipeline failure. Every variant is contained: it lands in the
/// run's error log as its `Display` rendering and the run carries on. The
/// tags exist so operators can alert on kind without parsing strings.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Page {page} fetch error: {source}")]
    Registry { page: u32, source: RegistryError },
    #[error("Pipeline fatal error: {source}")]
    Fatal { source: RegistryError },
    #[error("Batch change detection error: {source}")]
    ChangeLookup { source: StoreError },
    #[error("Rating change record error FHRSID {fhrsid}: {source}")]
    ChangeRecord { fhrsid: i64, source: StoreError },
    #[error("Upsert batch error ({rows} rows): {source}")]
    UpsertBatch { rows: usize, source: StoreError },
    #[error("Failed to start pipeline run: {source}")]
    RunStart { source: StoreError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Registry,
    Persistence,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Registry { .. } | PipelineError::Fatal { .. } => ErrorKind::Registry,
            PipelineError::ChangeLookup { .. }
            | PipelineError::ChangeRecord { .. }
            | PipelineError::UpsertBatch { .. }
            | PipelineError::RunStart { .. } => ErrorKind::Persistence,
        }
    }
}

/// Cumulative statistics for one run, including pages that partially
/// failed. Returned to the caller whether or not a run record was written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total_fetched: u64,
    pub new_establishments: u64,
    pub rating_changes: u64,
    pub errors: u64,
    pub error_log: Vec<String>,
}

impl PipelineStats {
    pub(crate) fn record_error(&mut self, err: PipelineError) {
        warn!(kind = ?err.kind(), "{err}");
        self.errors += 1;
        self.error_log.push(err.to_string());
    }

    pub fn totals(&self) -> RunTotals {
        RunTotals {
            total_fetched: self.total_fetched as i64,
            new_establishments: self.new_establishments as i64,
            rating_changes_detected: self.rating_changes as i64,
            errors: self.errors as i64,
        }
    }

    /// Flattened log for the run record; `None` when the run was clean.
    pub fn joined_error_log(&self) -> Option<String> {
        if self.error_log.is_empty() {
            None
        } else {
            Some(self.error_log.join("\n"))
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<dyn RegistrySource>,
    store: Arc<dyn EstablishmentStore>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<dyn RegistrySource>,
        store: Arc<dyn EstablishmentStore>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drive one full run. Never fails: every error is absorbed into the
    /// returned statistics, and a live run's record always ends
    /// `completed`.
    pub async fn run(&self, run_type: RunType) -> PipelineStats {
        let mut stats = PipelineStats::default();

        let mut run_id: Option<Uuid> = None;
        if !self.config.dry_run {
            match self.store.start_run(run_type).await {
                Ok(id) => run_id = Some(id),
                Err(err) => stats.record_error(PipelineError::RunStart { source: err }),
            }
        }

        info!(
            max_rating = self.config.max_rating,
            dry_run = self.config.dry_run,
            run_type = run_type.as_str(),
            "starting registry pull"
        );

        match self
            .registry
            .fetch_low_rated_page(1, self.config.page_size, self.config.max_rating)
            .await
        {
            Ok(first_page) => {
                // The first page reveals the upstream totals; clamp before
                // looping so bogus metadata cannot run away.
                let total_pages = first_page.total_pages.min(self.config.max_pages);
                info!(
                    total_count = first_page.total_count,
                    total_pages, "registry reported totals"
                );

                self.process_page(&first_page.establishments, &mut stats)
                    .await;

                for page in 2..=total_pages {
                    tokio::time::sleep(self.config.page_delay).await;

                    match self
                        .registry
                        .fetch_low_rated_page(page, self.config.page_size, self.config.max_rating)
                        .await
                    {
                        Ok(page_data) => {
                            self.process_page(&page_data.establishments, &mut stats).await;
                            if page % 10 == 0 {
                                info!(
                                    page,
                                    total_pages,
                                    fetched = stats.total_fetched,
                                    "pipeline progress"
                                );
                            }
                        }
                        // A single bad page never halts the run.
                        Err(err) => stats.record_error(PipelineError::Registry { page, source: err }),
                    }
                }
            }
            Err(err) => stats.record_error(PipelineError::Fatal { source: err }),
        }

        if let Some(run_id) = run_id {
            if let Err(err) = self
                .store
                .complete_run(run_id, stats.totals(), stats.joined_error_log().as_deref())
                .await
            {
                warn!(%run_id, error = %err, "failed to complete run record");
            }
        }

        info!(
            fetched = stats.total_fetched,
            new = stats.new_establishments,
            changes = stats.rating_changes,
            errors = stats.errors,
            "pipeline complete"
        );

        stats
    }

    async fn process_page(
        &self,
        raw: &[hfx_registry::RawEstablishment],
        stats: &mut PipelineStats,
    ) {
        let rows: Vec<_> = raw.iter().map(map_establishment).collect();
        stats.total_fetched += rows.len() as u64;
        if self.config.dry_run || rows.is_empty() {
            return;
        }

        // Detect against the store before the upsert overwrites the prior
        // state this page is being compared to.
        let changes = detect_rating_changes(self.store.as_ref(), &rows, stats).await;
        stats.rating_changes += changes;

        upsert_in_batches(
            self.store.as_ref(),
            &rows,
            self.config.upsert_batch_size,
            stats,
        )
        .await;
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron: String,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("HFX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("HFX_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

/// Wire the daily run onto a cron scheduler when enabled. The returned
/// scheduler still needs `.start()`.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    config: &SchedulerConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let stats = pipeline.run(RunType::Daily).await;
            info!(
                fetched = stats.total_fetched,
                errors = stats.errors,
                "scheduled pipeline run finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, stored, MockStore, ScriptedPage, ScriptedRegistry};
    use std::sync::atomic::Ordering;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            page_delay: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(
        config: PipelineConfig,
        registry: Arc<ScriptedRegistry>,
        store: Arc<MockStore>,
    ) -> Pipeline {
        Pipeline::new(config, registry, store)
    }

    #[tokio::test]
    async fn single_page_run_classifies_and_persists() {
        let registry = Arc::new(ScriptedRegistry::single_page(vec![
            raw(1, "1"),
            raw(2, "2"),
            raw(3, "0"),
        ]));
        let store = Arc::new(MockStore::default());
        store.seed(stored(2, "1", None));
        store.seed(stored(3, "0", None));

        let stats = pipeline(test_config(), registry, store.clone())
            .run(RunType::Manual)
            .await;

        assert_eq!(stats.total_fetched, 3);
        assert_eq!(stats.new_establishments, 1);
        assert_eq!(stats.rating_changes, 1);
        assert_eq!(stats.errors, 0);

        let changes = store.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fhrsid, 2);
        assert_eq!(changes[0].old_rating, "1");
        assert_eq!(changes[0].new_rating, "2");
        drop(changes);

        assert_eq!(store.snapshot().len(), 3);
        let completed = store.completed_runs.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.total_fetched, 3);
        assert_eq!(completed[0].2, None);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_and_run_still_completes() {
        let registry = Arc::new(ScriptedRegistry::new(
            vec![
                ScriptedPage::Rows(vec![raw(1, "1"), raw(2, "1")]),
                ScriptedPage::Fail,
                ScriptedPage::Rows(vec![raw(3, "2"), raw(4, "2")]),
            ],
            3,
        ));
        let store = Arc::new(MockStore::default());

        let stats = pipeline(test_config(), registry, store.clone())
            .run(RunType::Daily)
            .await;

        assert_eq!(stats.total_fetched, 4);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_log.len(), 1);
        assert!(stats.error_log[0].contains("Page 2"));
        assert_eq!(store.snapshot().len(), 4);

        let completed = store.completed_runs.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.errors, 1);
        assert!(completed[0].2.as_deref().unwrap().contains("Page 2"));
    }

    #[tokio::test]
    async fn dry_run_fetches_but_never_writes() {
        let registry = Arc::new(ScriptedRegistry::new(
            vec![
                ScriptedPage::Rows(vec![raw(1, "0"), raw(2, "0")]),
                ScriptedPage::Rows(vec![raw(3, "1"), raw(4, "1")]),
                ScriptedPage::Rows(vec![raw(5, "2")]),
            ],
            3,
        ));
        let store = Arc::new(MockStore::default());

        let config = PipelineConfig {
            dry_run: true,
            ..test_config()
        };
        let stats = pipeline(config, registry, store.clone())
            .run(RunType::Manual)
            .await;

        assert_eq!(stats.total_fetched, 5);
        assert_eq!(stats.errors, 0);
        assert!(store.snapshot().is_empty());
        assert_eq!(*store.bulk_reads.lock().unwrap(), 0);
        assert!(store.started_runs.lock().unwrap().is_empty());
        assert!(store.completed_runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_cap_bounds_a_lying_registry() {
        let pages = (0..5)
            .map(|i| ScriptedPage::Rows(vec![raw(i + 1, "2")]))
            .collect();
        let registry = Arc::new(ScriptedRegistry::new(pages, 5000));
        let store = Arc::new(MockStore::default());

        let config = PipelineConfig {
            max_pages: 3,
            ..test_config()
        };
        let stats = pipeline(config, registry.clone(), store)
            .run(RunType::Full)
            .await;

        assert_eq!(registry.calls.lock().unwrap().len(), 3);
        assert_eq!(stats.total_fetched, 3);
    }

    #[tokio::test]
    async fn zero_reported_pages_still_processes_page_one() {
        let registry = Arc::new(ScriptedRegistry::new(
            vec![ScriptedPage::Rows(vec![raw(1, "2"), raw(2, "2")])],
            0,
        ));
        let store = Arc::new(MockStore::default());

        let stats = pipeline(test_config(), registry.clone(), store.clone())
            .run(RunType::Daily)
            .await;

        assert_eq!(registry.calls.lock().unwrap().len(), 1);
        assert_eq!(stats.total_fetched, 2);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn first_page_failure_is_fatal_but_run_record_closes() {
        let registry = Arc::new(ScriptedRegistry::new(vec![ScriptedPage::Fail], 3));
        let store = Arc::new(MockStore::default());

        let stats = pipeline(test_config(), registry, store.clone())
            .run(RunType::Daily)
            .await;

        assert_eq!(stats.total_fetched, 0);
        assert_eq!(stats.errors, 1);
        assert!(stats.error_log[0].contains("Pipeline fatal error"));

        let completed = store.completed_runs.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.errors, 1);
    }

    #[tokio::test]
    async fn run_record_start_failure_does_not_abort_ingestion() {
        let registry = Arc::new(ScriptedRegistry::single_page(vec![raw(1, "1")]));
        let store = Arc::new(MockStore::default());
        store.fail_start_run.store(true, Ordering::SeqCst);

        let stats = pipeline(test_config(), registry, store.clone())
            .run(RunType::Daily)
            .await;

        assert_eq!(stats.errors, 1);
        assert!(stats.error_log[0].contains("Failed to start pipeline run"));
        assert_eq!(store.snapshot().len(), 1);
        // no run id, so nothing to finalize
        assert!(store.completed_runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_record_completion_failure_is_not_counted() {
        let registry = Arc::new(ScriptedRegistry::single_page(vec![raw(1, "1")]));
        let store = Arc::new(MockStore::default());
        store.fail_complete_run.store(true, Ordering::SeqCst);

        let stats = pipeline(test_config(), registry, store.clone())
            .run(RunType::Daily)
            .await;

        assert_eq!(stats.errors, 0);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn rating_filter_reaches_the_registry() {
        let registry = Arc::new(ScriptedRegistry::single_page(vec![raw(1, "0")]));
        let store = Arc::new(MockStore::default());

        let config = PipelineConfig {
            max_rating: 0,
            ..test_config()
        };
        pipeline(config, registry.clone(), store)
            .run(RunType::Manual)
            .await;

        let calls = registry.calls.lock().unwrap();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|(_, size, rating)| *size == PAGE_SIZE && *rating == 0));
    }

    #[test]
    fn joined_error_log_is_none_when_clean() {
        let mut stats = PipelineStats::default();
        assert_eq!(stats.joined_error_log(), None);
        stats.error_log.push("Page 2 fetch error: boom".into());
        stats.error_log.push("Upsert batch error (100 rows): boom".into());
        let joined = stats.joined_error_log().unwrap();
        assert_eq!(joined.lines().count(), 2);
    }
}
