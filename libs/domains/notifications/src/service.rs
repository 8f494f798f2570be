//! Ingress service: accepts notification requests, answers status queries and
//! cancels jobs.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::NotificationResult;
use crate::metrics;
use crate::models::{
    DeadLetterEntry, DeadLetterReason, JobFailure, JobFilter, JobId, JobStatus, JobStatusView,
    NewNotification, NotificationJob, Page, Precondition,
};
use crate::store::{CREATED_VERSION, JobStore, QueueStore, page_limit};

const MAX_LIST_LIMIT: usize = 100;
const MAX_CANCEL_ATTEMPTS: u32 = 5;

/// Retry budget applied when a request does not carry its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&PipelineConfig> for JobDefaults {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.default_max_retries,
            base_delay: config.default_base_delay,
        }
    }
}

#[derive(Clone)]
pub struct NotificationService {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    defaults: JobDefaults,
}

impl NotificationService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        defaults: JobDefaults,
    ) -> Self {
        Self {
            jobs,
            queue,
            clock,
            defaults,
        }
    }

    /// Create the record in `queued`, push it onto the ready list and return
    /// without waiting for delivery.
    #[instrument(skip(self, input), fields(recipients = input.recipients.len()))]
    pub async fn submit(&self, input: NewNotification) -> NotificationResult<JobId> {
        input.validate()?;

        let job_id = input
            .job_id
            .map(JobId::from)
            .unwrap_or_else(JobId::generate);
        let base_delay = input
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.defaults.base_delay);

        let job = NotificationJob::new(
            job_id,
            input.recipients,
            input.message,
            input.max_retries.unwrap_or(self.defaults.max_retries),
            base_delay,
            self.clock.now(),
        );

        let job_id = self.admit(job).await?;
        metrics::job_submitted();
        Ok(job_id)
    }

    /// Store a new record and make it claimable.
    ///
    /// If the record cannot be enqueued it is withdrawn again, so a failed
    /// admission leaves nothing behind and the same id can be resubmitted.
    pub(crate) async fn admit(&self, job: NotificationJob) -> NotificationResult<JobId> {
        let recipients = job.recipients.len();
        let max_retries = job.max_retries;
        let job_id = self.jobs.create(job).await?;

        if let Err(e) = self.queue.enqueue_ready(&job_id).await {
            self.withdraw(&job_id).await;
            return Err(e);
        }

        info!(
            job_id = %job_id,
            recipients,
            max_retries,
            "Notification job queued"
        );
        Ok(job_id)
    }

    async fn withdraw(&self, job_id: &JobId) {
        match self.jobs.withdraw(job_id, CREATED_VERSION).await {
            Ok(true) => warn!(job_id = %job_id, "Enqueue failed, job record withdrawn"),
            Ok(false) => error!(
                job_id = %job_id,
                "Enqueue failed and the record changed since creation, left in place"
            ),
            Err(e) => error!(
                job_id = %job_id,
                error = %e,
                "Enqueue failed and the record could not be withdrawn"
            ),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn get(&self, job_id: &JobId) -> NotificationResult<NotificationJob> {
        self.jobs.get(job_id).await
    }

    /// Status, attempt count and last error of a job.
    pub async fn status(&self, job_id: &JobId) -> NotificationResult<JobStatusView> {
        let job = self.get(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn list(&self, filter: JobFilter) -> NotificationResult<Page<JobStatusView>> {
        let filter = JobFilter {
            limit: page_limit(filter.limit, MAX_LIST_LIMIT),
            ..filter
        };
        let page = self.jobs.list(&filter).await?;
        Ok(Page {
            items: page.items.iter().map(JobStatusView::from).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Cancel a job by dead-lettering it.
    ///
    /// Terminal jobs are returned unchanged. A fan-out already in flight is
    /// not interrupted, but its result is discarded.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &JobId) -> NotificationResult<NotificationJob> {
        let mut attempts = 0;
        let (updated, failure, now) = loop {
            let job = self.jobs.get(job_id).await?;
            if job.is_terminal() {
                debug!(status = %job.status, "Job already terminal, nothing to cancel");
                return Ok(job);
            }
            attempts += 1;

            let now = self.clock.now();
            let failure = JobFailure::job_level(job.attempt, "cancelled", now);
            let recorded = failure.clone();

            match self
                .jobs
                .update(
                    job_id,
                    Precondition::at_attempt(job.status, job.attempt),
                    Box::new(move |j| {
                        j.status = JobStatus::DeadLettered;
                        j.next_run_at = None;
                        j.last_error = Some(recorded);
                        j.updated_at = now;
                    }),
                )
                .await
            {
                Ok(updated) => break (updated, failure, now),
                Err(e) if e.is_conflict() && attempts < MAX_CANCEL_ATTEMPTS => {
                    debug!(attempts, "Job changed during cancel, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        self.queue.discard(job_id).await?;
        self.queue
            .enqueue_dead_letter(&DeadLetterEntry {
                job: updated.clone(),
                dead_lettered_at: now,
                reason: DeadLetterReason::Cancelled,
                error: failure,
            })
            .await?;
        metrics::job_dead_lettered(&DeadLetterReason::Cancelled.to_string());

        info!(attempt = updated.attempt, "Notification job cancelled");
        Ok(updated)
    }

    pub fn defaults(&self) -> JobDefaults {
        self.defaults
    }

    /// Ping the stores through a cheap read.
    pub async fn ready(&self) -> NotificationResult<()> {
        let stats = self.queue.stats().await?;
        metrics::queue_depths(&stats);
        Ok(())
    }
}
