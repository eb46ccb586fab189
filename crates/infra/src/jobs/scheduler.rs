//! Job submission, result handles, and chords.
//!
//! A chord is a group of header jobs plus one callback job. The callback is
//! enqueued only once every header job has completed successfully; if any
//! header job ends in failure the chord resolves as failed once the whole
//! header is terminal and the callback never runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::executor::JobListener;
use super::store::{JobStore, JobStoreError};
use super::types::{ChordId, ChordRole, Job, JobId, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("scheduler state unavailable: {0}")]
    State(String),
}

#[derive(Debug, Default)]
struct ResultCell {
    outcome: Mutex<Option<Result<(), String>>>,
    resolved: Condvar,
}

/// Handle to the eventual outcome of a submitted job or chord.
///
/// Cloning yields another handle to the same outcome. The first resolution
/// wins; later ones are ignored.
#[derive(Debug, Clone, Default)]
pub struct AsyncResult {
    cell: Arc<ResultCell>,
}

impl AsyncResult {
    pub fn pending() -> Self {
        Self::default()
    }

    fn outcome(&self) -> MutexGuard<'_, Option<Result<(), String>>> {
        self.cell.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, outcome: Result<(), String>) {
        let mut slot = self.outcome();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cell.resolved.notify_all();
        }
    }

    pub fn resolve_success(&self) {
        self.resolve(Ok(()));
    }

    pub fn resolve_failure(&self, error: impl Into<String>) {
        self.resolve(Err(error.into()));
    }

    /// Whether the outcome is known.
    pub fn ready(&self) -> bool {
        self.outcome().is_some()
    }

    /// Whether the outcome is known and successful.
    pub fn successful(&self) -> bool {
        matches!(*self.outcome(), Some(Ok(())))
    }

    /// The failure message, if the outcome is a failure.
    pub fn failure(&self) -> Option<String> {
        match &*self.outcome() {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Block up to `timeout` for the outcome. Returns `ready()`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.outcome();
        let (guard, _) = self
            .cell
            .resolved
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.is_some()
    }
}

/// Submits jobs and chords for background execution.
pub trait JobScheduler: Send + Sync {
    /// Enqueue a single job.
    fn submit(&self, job: Job) -> Result<AsyncResult, SchedulerError>;

    /// Enqueue `header` and arrange for `callback` to run after all of it succeeds.
    fn chord(&self, header: Vec<Job>, callback: Job) -> Result<AsyncResult, SchedulerError>;
}

#[derive(Debug)]
struct ChordState {
    remaining: HashSet<JobId>,
    failures: Vec<String>,
    callback: Option<Job>,
    result: AsyncResult,
}

/// Tracks chord progress from terminal-job notifications.
pub struct ChordCoordinator<S: JobStore> {
    store: S,
    chords: Mutex<HashMap<ChordId, ChordState>>,
    singles: Mutex<HashMap<JobId, AsyncResult>>,
}

impl<S: JobStore> ChordCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            chords: Mutex::new(HashMap::new()),
            singles: Mutex::new(HashMap::new()),
        }
    }

    fn chords(&self) -> MutexGuard<'_, HashMap<ChordId, ChordState>> {
        self.chords.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn singles(&self) -> MutexGuard<'_, HashMap<JobId, AsyncResult>> {
        self.singles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, job: Job) -> Result<AsyncResult, SchedulerError> {
        let result = AsyncResult::pending();
        let job_id = job.id;
        self.singles().insert(job_id, result.clone());

        if let Err(e) = self.store.enqueue(job) {
            self.singles().remove(&job_id);
            return Err(e.into());
        }
        Ok(result)
    }

    fn chord(&self, header: Vec<Job>, callback: Job) -> Result<AsyncResult, SchedulerError> {
        let chord_id = ChordId::new();
        let result = AsyncResult::pending();
        let callback = callback.in_chord(chord_id, ChordRole::Callback);

        if header.is_empty() {
            debug!(chord_id = %chord_id, "empty chord header; enqueueing callback");
            self.chords().insert(
                chord_id,
                ChordState {
                    remaining: HashSet::new(),
                    failures: Vec::new(),
                    callback: None,
                    result: result.clone(),
                },
            );
            if let Err(e) = self.store.enqueue(callback) {
                self.abandon(chord_id, &e);
                return Err(e.into());
            }
            return Ok(result);
        }

        let header: Vec<Job> = header
            .into_iter()
            .map(|job| job.in_chord(chord_id, ChordRole::Header))
            .collect();

        // registered before the first enqueue so no completion can be missed
        self.chords().insert(
            chord_id,
            ChordState {
                remaining: header.iter().map(|j| j.id).collect(),
                failures: Vec::new(),
                callback: Some(callback),
                result: result.clone(),
            },
        );

        let size = header.len();
        for job in header {
            if let Err(e) = self.store.enqueue(job) {
                self.abandon(chord_id, &e);
                return Err(e.into());
            }
        }

        info!(chord_id = %chord_id, header_size = size, "chord submitted");
        Ok(result)
    }

    fn abandon(&self, chord_id: ChordId, error: &JobStoreError) {
        if let Some(state) = self.chords().remove(&chord_id) {
            state.result.resolve_failure(format!("chord could not be enqueued: {}", error));
        }
    }

    fn on_header_terminal(&self, chord_id: ChordId, job: &Job) {
        let callback = {
            let mut chords = self.chords();
            let Some(state) = chords.get_mut(&chord_id) else {
                debug!(chord_id = %chord_id, job_id = %job.id, "terminal job for unknown chord");
                return;
            };

            if !state.remaining.remove(&job.id) {
                return;
            }
            if let Some(error) = failure_of(job) {
                state.failures.push(error);
            }
            if !state.remaining.is_empty() {
                return;
            }

            if state.failures.is_empty() {
                state.callback.take()
            } else {
                let failed = state.failures.len();
                if let Some(state) = chords.remove(&chord_id) {
                    warn!(chord_id = %chord_id, failed, "chord header failed; callback skipped");
                    state.result.resolve_failure(state.failures.join("; "));
                }
                None
            }
        };

        if let Some(callback) = callback {
            info!(chord_id = %chord_id, callback_id = %callback.id, "chord header complete; enqueueing callback");
            if let Err(e) = self.store.enqueue(callback) {
                self.abandon(chord_id, &e);
            }
        }
    }

    fn on_callback_terminal(&self, chord_id: ChordId, job: &Job) {
        let Some(state) = self.chords().remove(&chord_id) else {
            return;
        };
        match failure_of(job) {
            None => state.result.resolve_success(),
            Some(error) => state.result.resolve_failure(error),
        }
    }
}

impl<S: JobStore> JobListener for ChordCoordinator<S> {
    fn on_terminal(&self, job: &Job) {
        match job.chord {
            Some(membership) => match membership.role {
                ChordRole::Header => self.on_header_terminal(membership.chord_id, job),
                ChordRole::Callback => self.on_callback_terminal(membership.chord_id, job),
            },
            None => {
                if let Some(result) = self.singles().remove(&job.id) {
                    match failure_of(job) {
                        None => result.resolve_success(),
                        Some(error) => result.resolve_failure(error),
                    }
                }
            }
        }
    }
}

fn failure_of(job: &Job) -> Option<String> {
    match &job.status {
        JobStatus::Completed => None,
        JobStatus::DeadLettered { error, .. } => {
            Some(format!("{} job {} failed: {}", job.kind.type_name(), job.id, error))
        }
        other => Some(format!("{} job {} ended as {:?}", job.kind.type_name(), job.id, other)),
    }
}

/// In-process scheduler backed by a [`JobStore`].
///
/// Register [`LocalScheduler::listener`] on every executor draining the same
/// store, otherwise chords never advance.
pub struct LocalScheduler<S: JobStore> {
    coordinator: Arc<ChordCoordinator<S>>,
}

impl<S: JobStore + 'static> LocalScheduler<S> {
    pub fn new(store: S) -> Self {
        Self {
            coordinator: Arc::new(ChordCoordinator::new(store)),
        }
    }

    pub fn listener(&self) -> Arc<dyn JobListener> {
        self.coordinator.clone()
    }
}

impl<S: JobStore + 'static> JobScheduler for LocalScheduler<S> {
    fn submit(&self, job: Job) -> Result<AsyncResult, SchedulerError> {
        self.coordinator.submit(job)
    }

    fn chord(&self, header: Vec<Job>, callback: Job) -> Result<AsyncResult, SchedulerError> {
        self.coordinator.chord(header, callback)
    }
}
