//! The batch ingestion pipeline.
//!
//! A phase expands into a deterministic task sequence (route x day type x
//! date chunk) processed strictly one at a time. Each task fetches service
//! metrics, then per-service details, normalizes them, and commits the
//! batch; only after the store acknowledges does the progress journal
//! record the task. Failures are isolated at the task boundary.

pub mod chunks;
pub mod normalize;
pub mod progress;

use std::path::Path;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PhaseConfig;
use crate::providers::hsp::{HspClient, HspError, MetricsQuery};
use crate::store::{Store, StoreError};
use chunks::FetchTask;
use normalize::DropCounts;
use progress::ProgressJournal;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Hsp(#[from] HspError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Progress journal error: {0}")]
    Journal(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct PhaseSummary {
    pub tasks_total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records_written: u64,
    pub interrupted: bool,
}

pub struct PhaseRunner {
    client: HspClient,
    store: Store,
    config: PhaseConfig,
}

impl PhaseRunner {
    pub fn new(client: HspClient, store: Store, config: PhaseConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Run the phase to completion or until `shutdown` flips true. The
    /// in-flight task always finishes through its store commit and journal
    /// write before the runner returns.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PhaseSummary, IngestError> {
        let tasks = chunks::expand_tasks(&self.config);
        let mut journal =
            ProgressJournal::open(Path::new(&self.config.progress_dir), &self.config.phase_name)?;
        journal.mark_started()?;

        let mut summary = PhaseSummary {
            tasks_total: tasks.len(),
            ..PhaseSummary::default()
        };
        info!(
            phase = %self.config.phase_name,
            tasks = tasks.len(),
            already_completed = journal.completed_count(),
            "Starting ingestion phase"
        );

        for (index, task) in tasks.iter().enumerate() {
            if *shutdown.borrow_and_update() {
                info!(
                    phase = %self.config.phase_name,
                    remaining = tasks.len() - index,
                    "Shutdown requested, stopping after committed work"
                );
                summary.interrupted = true;
                break;
            }

            let key = task.key();
            if journal.is_completed(&key) {
                summary.skipped += 1;
                continue;
            }

            info!(task = %key, index = index + 1, total = tasks.len(), "Processing task");
            match self.run_task(task).await {
                Ok(records) => {
                    // Journal only after the store committed the batch.
                    journal.mark_completed(&key, records)?;
                    summary.completed += 1;
                    summary.records_written += records;
                }
                Err(IngestError::Hsp(err)) if !err.is_retryable() => {
                    warn!(task = %key, error = %err, "Task failed permanently, continuing");
                    journal.mark_failed(&key, &err.to_string())?;
                    summary.failed += 1;
                }
                Err(IngestError::Hsp(err)) => {
                    // Retries are exhausted inside the client; record and move on.
                    warn!(task = %key, error = %err, "Task failed after retries, continuing");
                    journal.mark_failed(&key, &err.to_string())?;
                    summary.failed += 1;
                }
                // Store and journal failures are fatal: continuing would
                // silently drop committed-looking work.
                Err(err) => return Err(err),
            }
        }

        info!(
            phase = %self.config.phase_name,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            records = summary.records_written,
            "Phase finished"
        );
        Ok(summary)
    }

    async fn run_task(&mut self, task: &FetchTask) -> Result<u64, IngestError> {
        let query = MetricsQuery {
            from_loc: task.route.origin.clone(),
            to_loc: task.route.destination.clone(),
            from_date: task.chunk.start.to_string(),
            to_date: task.chunk.end.to_string(),
            from_time: task.route.from_time.clone(),
            to_time: task.route.to_time.clone(),
            days: task.day_type.to_string(),
        };
        let response = self.client.service_metrics(&query).await?;
        if response.services.is_empty() {
            info!(task = %task.key(), "No services matched");
            return Ok(0);
        }

        let mut drops = DropCounts::default();
        let mut metrics = Vec::new();
        let mut stops = Vec::new();

        for service in &response.services {
            let Some(metric) = normalize::normalize_metric(service, &mut drops) else {
                continue;
            };
            // One details call per matched service, keyed by its first RID.
            if let Some(rid) = metric.rids.first() {
                match self.client.service_details(rid).await {
                    Ok(details) => {
                        stops.extend(normalize::normalize_details(&details, &mut drops));
                    }
                    Err(err) if !err.is_retryable() => {
                        warn!(rid, error = %err, "Details fetch failed, skipping service");
                        drops.bump("details_fetch_failed");
                    }
                    Err(err) => {
                        warn!(rid, error = %err, "Details fetch failed after retries, skipping service");
                        drops.bump("details_fetch_failed");
                    }
                }
            }
            metrics.push(metric);
        }

        let records = self.store.commit_batch(&metrics, &stops).await?;
        if drops.total() > 0 {
            self.store
                .record_drops(&self.config.phase_name, &drops)
                .await?;
        }
        Ok(records)
    }
}
