//! Storage ports.
//!
//! - [`JobStore`]: the job records, the single source of truth for status.
//! - [`QueueStore`]: scheduling structures (ready, delayed, in-flight leases)
//!   and the append-only dead-letter set.
//!
//! Both are injected as `Arc<dyn ...>` so the worker can run against Redis in
//! production and the in-memory stores in tests.

mod memory;
mod redis_store;

pub use memory::{MemoryJobStore, MemoryQueueStore};
pub use redis_store::{RedisJobStore, RedisKeys, RedisQueueStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    DeadLetterEntry, JobFilter, JobId, NotificationJob, Page, Precondition, QueueStats,
};

/// In-place change applied to a job record by [`JobStore::update`].
pub type JobMutation = Box<dyn FnOnce(&mut NotificationJob) + Send>;

/// Version of a record as written by [`JobStore::create`].
pub const CREATED_VERSION: u64 = 1;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateJob` if the id exists.
    async fn create(&self, job: NotificationJob) -> NotificationResult<JobId>;

    async fn get(&self, id: &JobId) -> NotificationResult<NotificationJob>;

    /// Optimistic update: apply `mutation` only if the stored record matches
    /// `expected`, otherwise fail with `Conflict`. Returns the stored result.
    async fn update(
        &self,
        id: &JobId,
        expected: Precondition,
        mutation: JobMutation,
    ) -> NotificationResult<NotificationJob>;

    /// Page through records in creation order.
    async fn list(&self, filter: &JobFilter) -> NotificationResult<Page<NotificationJob>>;

    /// Delete a record only if it is still at `version`. Returns whether it
    /// was deleted. Used to undo an admission that never reached a queue.
    async fn withdraw(&self, id: &JobId, version: u64) -> NotificationResult<bool>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue_ready(&self, id: &JobId) -> NotificationResult<()>;

    async fn enqueue_delayed(&self, id: &JobId, ready_at: DateTime<Utc>) -> NotificationResult<()>;

    /// Atomically pop one ready job. With `lease_until`, the job is recorded
    /// as in flight until that deadline in the same step.
    async fn claim_ready(
        &self,
        lease_until: Option<DateTime<Utc>>,
    ) -> NotificationResult<Option<JobId>>;

    /// Move up to `limit` delayed jobs with `ready_at <= now` to ready.
    /// Each job is moved by exactly one caller.
    async fn promote_due_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> NotificationResult<Vec<JobId>>;

    /// Drop the in-flight lease of a job.
    async fn release(&self, id: &JobId) -> NotificationResult<()>;

    /// Push the lease deadline of a job still in flight to `until`.
    /// Returns `false` if the job holds no lease (released or reclaimed).
    async fn renew_lease(&self, id: &JobId, until: DateTime<Utc>) -> NotificationResult<bool>;

    /// Remove and return the jobs whose lease expired at or before `now`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> NotificationResult<Vec<JobId>>;

    /// Remove a job from ready, delayed and in-flight.
    async fn discard(&self, id: &JobId) -> NotificationResult<()>;

    /// Append to the dead-letter set. Entries are never re-enqueued.
    async fn enqueue_dead_letter(&self, entry: &DeadLetterEntry) -> NotificationResult<()>;

    async fn list_dead_letters(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> NotificationResult<Page<DeadLetterEntry>>;

    /// Latest dead-letter entry for a job.
    async fn get_dead_letter(&self, id: &JobId) -> NotificationResult<Option<DeadLetterEntry>>;

    async fn stats(&self) -> NotificationResult<QueueStats>;
}

/// Validate and apply an optimistic update to a copy of `current`.
///
/// Terminal records reject every update. A mutation may not change the
/// identity, recipients or message of a job, nor lower its attempt count.
pub(crate) fn apply_update(
    current: &NotificationJob,
    expected: &Precondition,
    mutation: JobMutation,
) -> NotificationResult<NotificationJob> {
    if current.is_terminal() || !expected.matches(current) {
        return Err(NotificationError::Conflict {
            job_id: current.id.clone(),
            expected: describe(expected.status, expected.attempt),
            actual: describe(current.status, Some(current.attempt)),
        });
    }

    let mut next = current.clone();
    mutation(&mut next);

    if next.id != current.id
        || next.recipients != current.recipients
        || next.message != current.message
        || next.created_at != current.created_at
    {
        return Err(NotificationError::Internal(format!(
            "update of job {} attempted to change immutable fields",
            current.id
        )));
    }
    if next.attempt < current.attempt {
        return Err(NotificationError::Internal(format!(
            "update of job {} attempted to lower attempt from {} to {}",
            current.id, current.attempt, next.attempt
        )));
    }

    next.version = current.version + 1;
    Ok(next)
}

pub(crate) fn describe(status: crate::models::JobStatus, attempt: Option<u32>) -> String {
    match attempt {
        Some(attempt) => format!("{status} (attempt {attempt})"),
        None => status.to_string(),
    }
}

/// Clamp a requested page size into `1..=max`.
pub(crate) fn page_limit(limit: usize, max: usize) -> usize {
    limit.clamp(1, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, Message};
    use serde_json::json;
    use std::time::Duration;

    fn job() -> NotificationJob {
        NotificationJob::new(
            JobId::from("job-1"),
            vec!["a".into()],
            Message(json!({})),
            3,
            Duration::from_secs(1),
            Utc::now(),
        )
    }

    #[test]
    fn test_apply_update_bumps_version() {
        let current = job();
        let next = apply_update(
            &current,
            &Precondition::status(JobStatus::Queued),
            Box::new(|j| j.status = JobStatus::Processing),
        )
        .unwrap();
        assert_eq!(next.status, JobStatus::Processing);
        assert_eq!(next.version, current.version + 1);
    }

    #[test]
    fn test_apply_update_rejects_unexpected_status() {
        let err = apply_update(
            &job(),
            &Precondition::status(JobStatus::Processing),
            Box::new(|j| j.status = JobStatus::Succeeded),
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_apply_update_rejects_terminal_records() {
        let mut current = job();
        current.status = JobStatus::Succeeded;
        let err = apply_update(
            &current,
            &Precondition::status(JobStatus::Succeeded),
            Box::new(|j| j.status = JobStatus::Queued),
        )
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_apply_update_rejects_attempt_regression_and_identity_change() {
        let mut current = job();
        current.attempt = 2;

        let err = apply_update(
            &current,
            &Precondition::status(JobStatus::Queued),
            Box::new(|j| j.attempt = 1),
        )
        .unwrap_err();
        assert!(matches!(err, NotificationError::Internal(_)));

        let err = apply_update(
            &current,
            &Precondition::status(JobStatus::Queued),
            Box::new(|j| j.id = JobId::from("other")),
        )
        .unwrap_err();
        assert!(matches!(err, NotificationError::Internal(_)));
    }

    #[test]
    fn test_page_limit_clamps() {
        assert_eq!(page_limit(0, 100), 1);
        assert_eq!(page_limit(50, 100), 50);
        assert_eq!(page_limit(500, 100), 100);
    }
}
