use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{error, info, warn};

use catalog_infra::content_source::{ContentSource, DiscoveryClient, StaticContentSource};
use catalog_infra::jobs::{
    InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobStore, JobStoreError, LocalScheduler,
};
use catalog_infra::schema::{MIGRATIONS, Migrator};
use catalog_infra::tasks::{self, TaskContext};

use super::Backend;
use crate::cli::UpdateContentMetadataArgs;
use crate::config::RefreshConfig;
use crate::orchestrator::{CatalogRefreshOrchestrator, RefreshOptions, RefreshSummary};

const DEAD_LETTER_REPORT_LIMIT: usize = 50;
const DRAIN_POLL: Duration = Duration::from_millis(200);
/// How long busy workers get to stop once the drain limit has passed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Entry point of `update-content-metadata`.
pub async fn execute(database_url: Option<&str>, args: &UpdateContentMetadataArgs) -> anyhow::Result<RefreshSummary> {
    let config = RefreshConfig::from_args(args)?;
    let backend = Backend::connect(database_url).await?;
    let source = content_source(&config)?;
    let options = RefreshOptions {
        catalog_uuids: args.catalog_uuids.clone(),
    };
    refresh(backend, source, &config, &options).await
}

fn content_source(config: &RefreshConfig) -> anyhow::Result<Arc<dyn ContentSource>> {
    match &config.discovery_api_url {
        Some(url) => {
            let mut client = DiscoveryClient::new(url.as_str()).context("invalid discovery API url")?;
            if let Some(token) = &config.discovery_api_token {
                client = client.with_token(token.as_str());
            }
            Ok(Arc::new(client))
        }
        None => {
            warn!("DISCOVERY_API_URL not set; discovery returns no content");
            Ok(Arc::new(StaticContentSource::new()))
        }
    }
}

/// Run one refresh against `backend` with a private worker pool.
///
/// Refuses to start while schema migrations are pending. Ending the wait does
/// not end the jobs: whatever is still queued, running or waiting for a retry
/// keeps running for up to `config.drain` more before the pool is stopped.
pub async fn refresh(
    backend: Backend,
    source: Arc<dyn ContentSource>,
    config: &RefreshConfig,
    options: &RefreshOptions,
) -> anyhow::Result<RefreshSummary> {
    let pending = Migrator::new(backend.migrations.as_ref(), MIGRATIONS).pending().await?;
    if !pending.is_empty() {
        let keys: Vec<String> = pending.iter().map(|m| m.key().to_string()).collect();
        bail!("unapplied migrations: {}; run `catalog-manage migrate` first", keys.join(", "));
    }

    let store = InMemoryJobStore::arc();
    let scheduler = Arc::new(LocalScheduler::new(store.clone()));

    let mut executor = JobExecutor::new(store.clone()).with_listener(scheduler.listener());
    tasks::register(
        &mut executor,
        TaskContext::new(backend.repository.clone(), source, tokio::runtime::Handle::current()),
    );
    let workers = executor
        .spawn(
            JobExecutorConfig::default()
                .with_name("catalog-refresh")
                .with_max_concurrent(config.workers),
        )
        .context("failed to start job workers")?;

    let orchestrator =
        CatalogRefreshOrchestrator::new(backend.repository, scheduler).with_wait_policy(config.wait);
    let summary = orchestrator.run(options).await;

    let left = outstanding(&store, &workers)?;
    if left > 0 {
        info!(outstanding = left, "letting {} outstanding jobs finish before exiting", left);
    }
    let drain_store = store.clone();
    let drain_limit = config.drain;
    let (workers, unfinished) = tokio::task::spawn_blocking(move || {
        let unfinished = drain(&drain_store, &workers, drain_limit);
        (workers, unfinished)
    })
    .await
    .context("job drain did not complete")?;
    let unfinished = unfinished?;
    if left > 0 && unfinished == 0 {
        info!("outstanding jobs finished");
    }

    let stats = workers.stats();
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        dead_lettered = stats.jobs_dead_lettered,
        "stopping job workers"
    );
    if unfinished == 0 {
        tokio::task::spawn_blocking(move || workers.shutdown())
            .await
            .context("job workers did not shut down")?;
    } else {
        error!(
            unfinished,
            drain_secs = drain_limit.as_secs(),
            "abandoning {} unfinished jobs; they did not finish within {} seconds after the wait",
            unfinished,
            drain_limit.as_secs()
        );
        tokio::task::spawn_blocking(move || workers.shutdown_within(SHUTDOWN_GRACE))
            .await
            .context("job workers did not shut down")?;
    }

    for entry in store.list_dead_letters(DEAD_LETTER_REPORT_LIMIT)? {
        warn!(
            job_id = %entry.job.id,
            kind = entry.job.kind.type_name(),
            attempts = entry.job.attempt,
            reason = %entry.reason,
            "job dead-lettered"
        );
    }

    Ok(summary?)
}

/// Jobs the pool still has to finish; a worker between finishing a job and
/// queueing its chord callback is counted as running.
fn outstanding(store: &InMemoryJobStore, workers: &JobExecutorHandle) -> Result<usize, JobStoreError> {
    Ok(store.stats()?.outstanding().max(workers.stats().current_running))
}

/// Keep the pool working until no job is left or `limit` passes.
///
/// Returns how many jobs were still unfinished.
fn drain(store: &InMemoryJobStore, workers: &JobExecutorHandle, limit: Duration) -> Result<usize, JobStoreError> {
    let deadline = Instant::now() + limit;
    loop {
        let left = outstanding(store, workers)?;
        let now = Instant::now();
        if left == 0 || now >= deadline {
            return Ok(left);
        }
        thread::sleep(DRAIN_POLL.min(deadline - now));
    }
}
