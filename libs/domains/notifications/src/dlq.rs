//! Dead-letter inspector.
//!
//! Read-only view over the dead-letter set plus an explicit operator
//! resubmission, which always creates a new job and leaves the dead-lettered
//! record untouched.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::clock::Clock;
use crate::error::{NotificationError, NotificationResult};
use crate::metrics;
use crate::models::{DeadLetterEntry, JobId, NotificationJob, Page, QueueStats};
use crate::service::NotificationService;
use crate::store::{QueueStore, page_limit};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct DeadLetterInspector {
    queue: Arc<dyn QueueStore>,
    service: NotificationService,
    clock: Arc<dyn Clock>,
}

impl DeadLetterInspector {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        service: NotificationService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            service,
            clock,
        }
    }

    /// Entries in dead-letter order; `page_size` is capped at [`MAX_PAGE_SIZE`].
    pub async fn list(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> NotificationResult<Page<DeadLetterEntry>> {
        self.queue
            .list_dead_letters(cursor, page_limit(page_size, MAX_PAGE_SIZE))
            .await
    }

    pub async fn get(&self, job_id: &JobId) -> NotificationResult<DeadLetterEntry> {
        self.queue
            .get_dead_letter(job_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(job_id.clone()))
    }

    pub async fn stats(&self) -> NotificationResult<QueueStats> {
        let stats = self.queue.stats().await?;
        metrics::queue_depths(&stats);
        Ok(stats)
    }

    /// Create a fresh job from a dead-lettered snapshot: same recipients,
    /// message and retry budget, new id, attempt 0.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn resubmit(&self, job_id: &JobId) -> NotificationResult<JobId> {
        let entry = self.get(job_id).await?;
        let snapshot = entry.job;
        let base_delay = snapshot.base_delay();

        let job = NotificationJob::new(
            JobId::generate(),
            snapshot.recipients,
            snapshot.message,
            snapshot.max_retries,
            base_delay,
            self.clock.now(),
        );

        let new_id = self.service.admit(job).await?;
        metrics::dead_letter_resubmitted();
        info!(new_job_id = %new_id, "Resubmitted dead-lettered job");
        Ok(new_id)
    }
}
