//! Background job system with retry, backoff, dead-letter handling, and chords.
//!
//! ## Components
//!
//! - `Job`: job abstraction with payload, retry policy, and attempt history
//! - `JobStore`: persistence for jobs
//! - `JobExecutor`: worker pool running jobs through registered handlers
//! - `JobScheduler`: submission of single jobs and chords, returning `AsyncResult` handles

pub mod executor;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobListener};
pub use scheduler::{AsyncResult, ChordCoordinator, JobScheduler, LocalScheduler, SchedulerError};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    Backoff, ChordId, ChordRole, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus,
    RetryPolicy,
};
