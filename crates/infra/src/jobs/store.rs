//! Where jobs wait between attempts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Persist the state of a job that is already stored.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Mark the oldest ready job running and return it.
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Remove `job` from the queue and keep it for inspection.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    /// Dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    /// Waiting for a retry.
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    /// Jobs that will still run: queued, running, or waiting for a retry.
    pub fn outstanding(&self) -> usize {
        self.pending + self.running + self.failed
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[derive(Debug, Default)]
struct Queue {
    /// Keyed by time-ordered id, so iteration order is submission order.
    jobs: BTreeMap<JobId, Job>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// Process-local job store; the management command runs its fan-out on it.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    queue: Mutex<Queue>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut queue = self.lock();
        if queue.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        queue.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut queue = self.lock();
        let stored = queue.jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        *stored = job.clone();
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut queue = self.lock();
        let next = queue
            .jobs
            .values_mut()
            .find(|j| matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }) && j.is_ready());

        Ok(next.map(|job| {
            job.mark_running();
            job.clone()
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut queue = self.lock();
        queue.jobs.remove(&job.id);

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();
        queue.dead_letters.push(DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        Ok(self.lock().dead_letters.iter().take(limit).cloned().collect())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let queue = self.lock();
        let mut stats = JobStats {
            dead_lettered: queue.dead_letters.len(),
            ..Default::default()
        };
        for job in queue.jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;
    use serde_json::json;

    fn job(kind: &str) -> Job {
        Job::new(JobKind::custom(kind), json!({}))
    }

    #[test]
    fn claim_marks_running_in_submission_order() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("a")).unwrap();
        let second = store.enqueue(job("b")).unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        assert_eq!(store.claim_next().unwrap().unwrap().id, second);
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn scheduled_retry_is_not_claimed_early() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("a")).unwrap();

        let mut claimed = store.claim_next().unwrap().unwrap();
        claimed.mark_failed("flaky".into(), Utc::now());
        claimed.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.update(&claimed).unwrap();

        assert!(store.claim_next().unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.outstanding(), 1);
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = job("a");
        store.enqueue(job.clone()).unwrap();
        assert!(matches!(store.enqueue(job), Err(JobStoreError::AlreadyExists(_))));
    }

    #[test]
    fn update_of_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.update(&job("a")), Err(JobStoreError::NotFound(_))));
    }

    #[test]
    fn dead_letters_leave_the_queue() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job("a")).unwrap();
        store.enqueue(job("b")).unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        store.dead_letter(claimed, "discovery returned 404".into()).unwrap();

        assert!(store.get(id).unwrap().is_none());
        let dead = store.list_dead_letters(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, id);
        assert_eq!(dead[0].reason, "discovery returned 404");

        let stats = store.stats().unwrap();
        assert_eq!((stats.pending, stats.dead_lettered), (1, 1));
    }
}
