//! Fan-out of catalog metadata refresh jobs with a single finalization job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info};

use catalog_core::{CatalogQueryId, CatalogUuid};
use catalog_domain::COURSE;
use catalog_infra::jobs::{AsyncResult, JobScheduler, SchedulerError};
use catalog_infra::repository::{CatalogRepository, RepositoryError};
use catalog_infra::tasks::{update_catalog_metadata_job, update_full_content_metadata_job};

/// How long, and in what slices, to wait for the refresh to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(30 * 60),
        }
    }
}

impl WaitPolicy {
    /// Number of wait slices that cover `max_wait`.
    pub fn slices(&self) -> u64 {
        let interval = self.poll_interval.as_millis().max(1);
        self.max_wait.as_millis().div_ceil(interval) as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// Accepted for command-line compatibility; the refresh always covers every query in use.
    pub catalog_uuids: Vec<CatalogUuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub outcome: RefreshOutcome,
    pub submitted_queries: Vec<CatalogQueryId>,
    pub content_keys: usize,
    pub waited: Duration,
    pub failure: Option<String>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("waiting for refresh jobs failed: {0}")]
    Wait(String),
}

pub struct CatalogRefreshOrchestrator {
    repository: Arc<dyn CatalogRepository>,
    scheduler: Arc<dyn JobScheduler>,
    wait: WaitPolicy,
}

impl CatalogRefreshOrchestrator {
    pub fn new(repository: Arc<dyn CatalogRepository>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            repository,
            scheduler,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Submit one refresh job per catalog query in use, chained to a single
    /// full-metadata job, then wait for the chain within the wait policy.
    ///
    /// Job failures and timeouts are logged and reported in the summary; only
    /// failing to read the catalog or to submit the jobs is an error.
    pub async fn run(&self, options: &RefreshOptions) -> Result<RefreshSummary, RefreshError> {
        if !options.catalog_uuids.is_empty() {
            info!(
                catalog_uuids = ?options.catalog_uuids,
                "catalog uuid filter is not applied; refreshing every catalog query in use"
            );
        }

        let queries = self.repository.catalog_queries_in_use().await?;
        let mut header = Vec::with_capacity(queries.len());
        for query in &queries {
            info!(
                catalog_query_id = %query.id,
                "spinning off update_catalog_metadata job to update content metadata for {}",
                query
            );
            header.push(update_catalog_metadata_job(query.id));
        }

        // fixed at submission; never receives header outputs
        let content_keys = self.repository.all_content_keys().await?;
        info!(
            content_keys = content_keys.len(),
            "spinning off update_full_content_metadata job to replace minimal json_metadata with full course metadata"
        );
        let key_count = content_keys.len();
        let callback = update_full_content_metadata_job(content_keys);

        let result = self.scheduler.chord(header, callback)?;
        let waited = self.wait_for(&result).await?;

        info!(
            waited_secs = waited.as_secs(),
            "waited about {} total seconds for the async jobs to complete",
            waited.as_secs()
        );

        let outcome = if !result.ready() {
            RefreshOutcome::TimedOut
        } else if result.successful() {
            RefreshOutcome::Succeeded
        } else {
            RefreshOutcome::Failed
        };

        let failure = result.failure();
        match outcome {
            RefreshOutcome::Succeeded => info!(
                "content metadata was associated with its catalog queries and records of content type \"{}\" were updated with full course metadata",
                COURSE
            ),
            RefreshOutcome::Failed | RefreshOutcome::TimedOut => error!(
                outcome = ?outcome,
                failure = failure.as_deref().unwrap_or("not finished"),
                "could not successfully complete all async jobs spun off from the command"
            ),
        }

        Ok(RefreshSummary {
            outcome,
            submitted_queries: queries.iter().map(|q| q.id).collect(),
            content_keys: key_count,
            waited,
            failure,
        })
    }

    /// Block in `poll_interval` slices until `result` is ready or `max_wait` elapses.
    async fn wait_for(&self, result: &AsyncResult) -> Result<Duration, RefreshError> {
        let started = Instant::now();

        for _ in 0..self.wait.slices() {
            let remaining = self.wait.max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let slice = self.wait.poll_interval.min(remaining);
            let handle = result.clone();
            let ready = tokio::task::spawn_blocking(move || handle.wait_timeout(slice))
                .await
                .map_err(|e| RefreshError::Wait(e.to_string()))?;
            if ready {
                return Ok(started.elapsed());
            }
        }

        if !result.ready() {
            error!(
                max_wait_secs = self.wait.max_wait.as_secs(),
                "the command took longer than {} seconds to be ready",
                self.wait.max_wait.as_secs()
            );
        }
        Ok(started.elapsed())
    }
}
