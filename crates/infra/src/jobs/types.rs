//! Job records, retry policies and chord membership.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! time_ordered_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// UUIDv7, so ids sort in creation order.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

time_ordered_id!(
    /// Unique job identifier.
    JobId
);
time_ordered_id!(
    /// Identifier of a chord (fan-out header + fan-in callback).
    ChordId
);

/// What a job does; selects its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Refresh the content associated with one catalog query.
    UpdateCatalogMetadata,
    /// Replace minimal course metadata with the full course documents.
    UpdateFullContentMetadata,
    Custom { kind: String },
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    /// Routing name used by the executor's handler registry.
    pub fn type_name(&self) -> &str {
        match self {
            JobKind::UpdateCatalogMetadata => "catalog.update_catalog_metadata",
            JobKind::UpdateFullContentMetadata => "catalog.update_full_content_metadata",
            JobKind::Custom { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Last attempt failed; another one is scheduled.
    Failed { error: String, attempt: u32 },
    /// No further attempts will be made.
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// How often, and how far apart, a failing job is attempted.
///
/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// A single attempt; a failure dead-letters the job.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Whether another execution is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordRole {
    Header,
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChordMembership {
    pub chord_id: ChordId,
    pub role: ChordRole,
}

/// One execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Fixed at construction; never rewritten with other jobs' outputs.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Executions started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff).
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<Attempt>,
    pub chord: Option<ChordMembership>,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
            chord: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub(crate) fn in_chord(mut self, chord_id: ChordId, role: ChordRole) -> Self {
        self.chord = Some(ChordMembership { chord_id, role });
        self
    }

    pub fn is_ready(&self) -> bool {
        self.scheduled_at.is_none_or(|at| Utc::now() >= at)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        self.finish_attempt(started_at, None);
        self.status = JobStatus::Completed;
    }

    /// Schedule a retry, or dead-letter the job once its retry policy is exhausted.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = self.finish_attempt(started_at, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Dead-letter regardless of the retry policy.
    pub fn mark_dead_lettered(&mut self, error: String, started_at: DateTime<Utc>) {
        self.finish_attempt(started_at, Some(error.clone()));
        self.status = JobStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    fn finish_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) -> DateTime<Utc> {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(Attempt {
            number: self.attempt,
            started_at,
            finished_at: now,
            error,
        });
        now
    }
}

/// What a handler reports back to the executor.
#[derive(Debug)]
pub enum JobResult {
    Success,
    /// Failed; the retry policy decides whether it runs again.
    Failure(String),
    /// Failed in a way retrying cannot fix.
    Abort(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn no_retry_allows_a_single_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn completed_attempt_is_recorded() {
        let mut job = Job::new(JobKind::UpdateCatalogMetadata, serde_json::json!({"catalog_query_id": 1}));
        assert_eq!(job.status, JobStatus::Pending);

        job.mark_running();
        assert_eq!(job.attempt, 1);

        job.mark_completed(Utc::now());
        assert!(job.status.is_terminal());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].error.is_none());
    }

    #[test]
    fn failures_retry_then_dead_letter() {
        let mut job = Job::new(JobKind::custom("test"), serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10)));

        job.mark_running();
        job.mark_failed("error 1".to_string(), Utc::now());
        assert!(job.status.is_retriable());
        assert!(job.scheduled_at.is_some());

        job.mark_running();
        job.mark_failed("error 2".to_string(), Utc::now());
        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: "error 2".to_string(),
                attempts: 2
            }
        );
    }

    #[test]
    fn kinds_route_under_catalog_namespace() {
        assert_eq!(JobKind::UpdateCatalogMetadata.type_name(), "catalog.update_catalog_metadata");
        assert_eq!(
            JobKind::UpdateFullContentMetadata.type_name(),
            "catalog.update_full_content_metadata"
        );
        assert_eq!(JobKind::custom("ops.cleanup").type_name(), "ops.cleanup");
    }
}
