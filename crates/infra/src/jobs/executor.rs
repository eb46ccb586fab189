//! Worker pool that runs jobs from a [`JobStore`] with retries and dead-lettering.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Observer notified once a job reaches a terminal status.
pub trait JobListener: Send + Sync {
    fn on_terminal(&self, job: &Job);
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    /// Number of worker threads
    pub max_concurrent: usize,
    /// Name for logging and thread names
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor pool.
#[derive(Debug)]
pub struct JobExecutorHandle {
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown; each worker finishes its current job first.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }
        for (_, join) in self.workers {
            join_worker(join);
        }
    }

    /// Request shutdown and wait at most `grace` for the workers to stop.
    ///
    /// Workers still inside a job when `grace` runs out are detached and
    /// finish that job on their own. Returns how many were detached.
    pub fn shutdown_within(self, grace: Duration) -> usize {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }

        let deadline = Instant::now() + grace;
        let mut busy: Vec<thread::JoinHandle<()>> = self.workers.into_iter().map(|(_, join)| join).collect();
        loop {
            let (stopped, running): (Vec<_>, Vec<_>) = busy.into_iter().partition(|join| join.is_finished());
            stopped.into_iter().for_each(join_worker);
            busy = running;
            if busy.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if !busy.is_empty() {
            warn!(workers = busy.len(), "job workers still busy at shutdown; detaching them");
        }
        busy.len()
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Background job executor.
///
/// Polls a job store for pending jobs, executes them with registered handlers,
/// and handles retries and dead-lettering.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
    listener: Option<Arc<dyn JobListener>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    /// Create a new executor with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            listener: None,
        }
    }

    /// Attach the observer told about every terminal job.
    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register a handler for a job kind.
    ///
    /// `pattern` is an exact type name, a `prefix.*` category, or `*`.
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if type_name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Spawn `config.max_concurrent` worker threads sharing this executor.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let executor = Arc::new(self);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let started = Instant::now();
        let mut workers = Vec::with_capacity(config.max_concurrent);

        for worker_id in 0..config.max_concurrent.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let executor = executor.clone();
            let stats = stats.clone();
            let config = config.clone();

            let join = thread::Builder::new()
                .name(format!("{}-{}", config.name, worker_id))
                .spawn(move || worker_loop(&executor, &config, worker_id, shutdown_rx, &stats, started))?;

            workers.push((shutdown_tx, join));
        }

        info!(executor = %config.name, workers = workers.len(), "job executor started");
        Ok(JobExecutorHandle { workers, stats })
    }

    /// Execute a claimed job once (for tests or synchronous use).
    pub fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let result = self.run_job(job);
        self.finish(job);
        result
    }

    fn run_job(&self, job: &mut Job) -> Result<(), String> {
        let started = Utc::now();

        let Some(handler) = self.get_handler(&job.kind) else {
            let error = format!("no handler for job kind: {}", job.kind.type_name());
            warn!(job_id = %job.id, error = %error, "no handler for job");
            job.mark_dead_lettered(error.clone(), started);
            return Err(error);
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(job)))
            .unwrap_or_else(|_| JobResult::Failure("job handler panicked".to_string()));

        match outcome {
            JobResult::Success => {
                job.mark_completed(started);
                debug!(job_id = %job.id, kind = job.kind.type_name(), "job completed successfully");
                Ok(())
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                Err(error)
            }
            JobResult::Abort(error) => {
                job.mark_dead_lettered(error.clone(), started);
                Err(error)
            }
        }
    }

    /// Persist the job's new state and, if terminal, dead-letter / notify.
    fn finish(&self, job: &Job) {
        if let JobStatus::DeadLettered { error, .. } = &job.status {
            warn!(job_id = %job.id, kind = job.kind.type_name(), error = %error, "job dead-lettered");
            if let Err(e) = self.store.dead_letter(job.clone(), error.clone()) {
                error!(job_id = %job.id, error = %e, "failed to dead-letter job");
            }
        } else if let Err(e) = self.store.update(job) {
            error!(job_id = %job.id, error = %e, "failed to persist job state");
        }

        if job.status.is_terminal() {
            if let Some(listener) = &self.listener {
                listener.on_terminal(job);
            }
        }
    }
}

fn worker_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    config: &JobExecutorConfig,
    worker_id: usize,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<ExecutorStats>,
    started: Instant,
) {
    debug!(executor = %config.name, worker_id, "worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match executor.store.claim_next() {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    worker_id,
                    job_id = %job.id,
                    kind = job.kind.type_name(),
                    attempt = job.attempt,
                    "claimed job"
                );

                update_stats(stats, started, |s| s.current_running += 1);

                let result = executor.execute_one(&mut job);

                update_stats(stats, started, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match (&result, &job.status) {
                        (Ok(()), _) => s.jobs_succeeded += 1,
                        (Err(_), JobStatus::DeadLettered { .. }) => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                        (Err(_), _) => s.jobs_failed += 1,
                    }
                });

                if let Err(e) = result {
                    debug!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        status = ?job.status,
                        "job execution failed"
                    );
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    debug!(executor = %config.name, worker_id, "worker stopped");
}

fn join_worker(join: thread::JoinHandle<()>) {
    let name = join.thread().name().unwrap_or("job-worker").to_string();
    if join.join().is_err() {
        error!(worker = %name, "job worker panicked");
    }
}

fn update_stats(stats: &Mutex<ExecutorStats>, started: Instant, f: impl FnOnce(&mut ExecutorStats)) {
    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    s.uptime_secs = started.elapsed().as_secs();
    f(&mut s);
}
