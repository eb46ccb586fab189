//! Catalog task handlers and the jobs that invoke them.
//!
//! Handlers run on executor worker threads and bridge into async IO through
//! the runtime handle carried by [`TaskContext`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use catalog_core::{CatalogQueryId, ContentKey};

use crate::content_source::{ContentSource, ContentSourceError};
use crate::jobs::{Job, JobExecutor, JobKind, JobResult, JobStore, RetryPolicy};
use crate::repository::{CatalogRepository, RepositoryError};

pub mod backfill;
pub mod refresh;

pub use backfill::{BATCH_SIZE, BackfillReport, update_full_content_metadata};
pub use refresh::{RefreshReport, update_catalog_metadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCatalogMetadataPayload {
    pub catalog_query_id: CatalogQueryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFullContentMetadataPayload {
    pub content_keys: Vec<ContentKey>,
}

fn task_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60))
}

/// Job refreshing the content selected by one catalog query.
pub fn update_catalog_metadata_job(catalog_query_id: CatalogQueryId) -> Job {
    let payload = UpdateCatalogMetadataPayload { catalog_query_id };
    Job::new(JobKind::UpdateCatalogMetadata, serde_json::json!(payload)).with_retry_policy(task_retry_policy())
}

/// Job backfilling full course metadata for `content_keys`.
pub fn update_full_content_metadata_job(content_keys: Vec<ContentKey>) -> Job {
    let payload = UpdateFullContentMetadataPayload { content_keys };
    Job::new(JobKind::UpdateFullContentMetadata, serde_json::json!(payload)).with_retry_policy(task_retry_policy())
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("catalog query {0} does not exist")]
    QueryNotFound(CatalogQueryId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Source(#[from] ContentSourceError),
}

impl TaskError {
    /// Whether running the job again could succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            TaskError::Payload(_) | TaskError::QueryNotFound(_) => false,
            TaskError::Repository(e) => matches!(e, RepositoryError::Storage(_)),
            TaskError::Source(e) => match e {
                ContentSourceError::Network(_) => true,
                ContentSourceError::Api { status, .. } => *status >= 500 || *status == 429,
                ContentSourceError::Parse(_) | ContentSourceError::Config(_) => false,
            },
        }
    }
}

/// Everything the handlers need.
#[derive(Clone)]
pub struct TaskContext {
    pub repository: Arc<dyn CatalogRepository>,
    pub source: Arc<dyn ContentSource>,
    pub runtime: tokio::runtime::Handle,
}

impl TaskContext {
    pub fn new(
        repository: Arc<dyn CatalogRepository>,
        source: Arc<dyn ContentSource>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            repository,
            source,
            runtime,
        }
    }
}

fn outcome(job: &Job, result: Result<(), TaskError>) -> JobResult {
    match result {
        Ok(()) => JobResult::Success,
        Err(e) if e.is_retriable() => {
            warn!(job_id = %job.id, kind = job.kind.type_name(), attempt = job.attempt, error = %e, "task failed; will retry if attempts remain");
            JobResult::Failure(e.to_string())
        }
        Err(e) => {
            error!(job_id = %job.id, kind = job.kind.type_name(), error = %e, "task failed permanently");
            JobResult::Abort(e.to_string())
        }
    }
}

/// Register both catalog task handlers on `executor`.
pub fn register<S: JobStore + 'static>(executor: &mut JobExecutor<S>, ctx: TaskContext) {
    let refresh_ctx = ctx.clone();
    executor.register_handler(JobKind::UpdateCatalogMetadata.type_name(), move |job| {
        let result = serde_json::from_value::<UpdateCatalogMetadataPayload>(job.payload.clone())
            .map_err(TaskError::from)
            .and_then(|payload| {
                refresh_ctx
                    .runtime
                    .block_on(update_catalog_metadata(&refresh_ctx, payload.catalog_query_id))
                    .map(|_| ())
            });
        outcome(job, result)
    });

    let backfill_ctx = ctx;
    executor.register_handler(JobKind::UpdateFullContentMetadata.type_name(), move |job| {
        let result = serde_json::from_value::<UpdateFullContentMetadataPayload>(job.payload.clone())
            .map_err(TaskError::from)
            .and_then(|payload| {
                backfill_ctx
                    .runtime
                    .block_on(update_full_content_metadata(&backfill_ctx, &payload.content_keys))
                    .map(|_| ())
            });
        outcome(job, result)
    });
}
