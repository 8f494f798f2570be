//! Worker loop.
//!
//! Each tick:
//! 1. reclaims expired leases (when leases are enabled and the reap interval passed),
//! 2. promotes due delayed jobs into the ready list,
//! 3. claims one ready job and runs it through executor and scheduler,
//!    renewing the claim lease while the fan-out runs.
//!
//! Any number of workers may run against the same stores. Exclusivity comes
//! from the atomic claim and from fencing every record update on the status
//! and attempt the worker observed.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, add_duration};
use crate::config::WorkerConfig;
use crate::error::{NotificationError, NotificationResult};
use crate::executor::FanOutExecutor;
use crate::metrics;
use crate::models::{
    DeadLetterEntry, DeadLetterReason, FanOutResult, JobFailure, JobId, JobStatus,
    NotificationJob, Precondition,
};
use crate::scheduler::{RetryPolicy, Transition};
use crate::store::{JobStore, QueueStore};

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Why a claimed job was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AbandonReason {
    /// The queue referenced a job with no record.
    Missing,
    /// The record was already terminal.
    Terminal,
    /// The record was in a state no worker may claim from (e.g. processing).
    NotClaimable,
    /// Another writer advanced the record before it could be marked processing.
    Conflict,
    /// The record moved on while the fan-out ran (cancelled or reclaimed);
    /// the pass result was discarded.
    Superseded,
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Succeeded,
    RetryScheduled { next_run_at: DateTime<Utc> },
    DeadLettered,
    Failed,
    Abandoned(AbandonReason),
}

impl ProcessOutcome {
    fn from_transition(transition: &Transition) -> Self {
        match transition {
            Transition::Succeed { .. } => ProcessOutcome::Succeeded,
            Transition::Retry { next_run_at, .. } => ProcessOutcome::RetryScheduled {
                next_run_at: *next_run_at,
            },
            Transition::DeadLetter { .. } => ProcessOutcome::DeadLettered,
            Transition::Fail { .. } => ProcessOutcome::Failed,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Succeeded => "succeeded",
            ProcessOutcome::RetryScheduled { .. } => "retry_scheduled",
            ProcessOutcome::DeadLettered => "dead_lettered",
            ProcessOutcome::Failed => "failed",
            ProcessOutcome::Abandoned(_) => "abandoned",
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No ready job was available.
    Idle,
    Processed {
        job_id: JobId,
        outcome: ProcessOutcome,
    },
}

pub struct Worker {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn QueueStore>,
    executor: Arc<FanOutExecutor>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    last_reap: Mutex<Option<DateTime<Utc>>>,
}

impl Worker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn QueueStore>,
        executor: Arc<FanOutExecutor>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            executor,
            policy,
            clock,
            config,
            last_reap: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A job already claimed is finished before the loop exits. Store errors
    /// are logged and retried with exponential backoff; they never end the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> NotificationResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_ms = self.config.lease.map(|l| l.as_millis() as u64),
            dispatch = ?self.executor.mode(),
            "Starting fan-out worker"
        );

        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.config.worker_id, "Received shutdown signal, stopping worker");
                break;
            }

            let pause = match self.tick().await {
                Ok(outcome) => {
                    if consecutive_errors > 0 {
                        info!(
                            worker_id = %self.config.worker_id,
                            "Store recovered after {} errors", consecutive_errors
                        );
                        consecutive_errors = 0;
                    }
                    match outcome {
                        TickOutcome::Idle => Some(self.config.poll_interval),
                        TickOutcome::Processed { .. } => None,
                    }
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = error_backoff(self.config.poll_interval, consecutive_errors);
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Worker tick failed, backing off"
                    );
                    Some(backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(worker_id = %self.config.worker_id, "Received shutdown signal, stopping worker");
                            break;
                        }
                    }
                    _ = self.clock.sleep(pause) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Fan-out worker stopped");
        Ok(())
    }

    /// One iteration: reap, promote, claim and process at most one job.
    pub async fn tick(&self) -> NotificationResult<TickOutcome> {
        self.reap_if_due().await?;
        self.promote_due().await?;

        let lease_until = self
            .config
            .lease
            .map(|lease| add_duration(self.clock.now(), lease));

        match self.queue.claim_ready(lease_until).await? {
            None => Ok(TickOutcome::Idle),
            Some(job_id) => {
                let outcome = self.process_claimed(&job_id).await?;
                Ok(TickOutcome::Processed { job_id, outcome })
            }
        }
    }

    /// Move due delayed jobs to ready and flip their records back to `queued`.
    ///
    /// The record flip is best effort: a worker that claims the job first
    /// accepts `retry_scheduled` as well.
    pub async fn promote_due(&self) -> NotificationResult<usize> {
        let now = self.clock.now();
        let promoted = self
            .queue
            .promote_due_delayed(now, self.config.promote_batch)
            .await?;
        if promoted.is_empty() {
            return Ok(0);
        }

        for job_id in &promoted {
            let job = match self.jobs.get(job_id).await {
                Ok(job) => job,
                Err(NotificationError::NotFound(_)) => {
                    warn!(job_id = %job_id, "Promoted job has no record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if job.status != JobStatus::RetryScheduled {
                continue;
            }

            let result = self
                .jobs
                .update(
                    job_id,
                    Precondition::at_attempt(JobStatus::RetryScheduled, job.attempt),
                    Box::new(move |j| {
                        j.status = JobStatus::Queued;
                        j.next_run_at = None;
                        j.updated_at = now;
                    }),
                )
                .await;

            match result {
                Ok(_) => debug!(job_id = %job_id, attempt = job.attempt, "Promoted delayed job"),
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job_id, "Promoted job already advanced by another worker")
                }
                Err(e) => return Err(e),
            }
        }

        metrics::jobs_promoted(promoted.len());
        Ok(promoted.len())
    }

    /// Process one job this worker popped from the ready list.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn process_claimed(&self, job_id: &JobId) -> NotificationResult<ProcessOutcome> {
        let started = Instant::now();

        let job = match self.jobs.get(job_id).await {
            Ok(job) => job,
            Err(NotificationError::NotFound(_)) => {
                warn!(job_id = %job_id, "Claimed job has no record, dropping reference");
                self.queue.release(job_id).await?;
                return Ok(self.abandon(job_id, AbandonReason::Missing));
            }
            Err(e) => return Err(e),
        };

        if job.is_terminal() {
            self.queue.discard(job_id).await?;
            return Ok(self.abandon(job_id, AbandonReason::Terminal));
        }
        if !job.status.is_claimable() {
            return Ok(self.abandon(job_id, AbandonReason::NotClaimable));
        }

        let claimed_attempt = job.attempt;
        let now = self.clock.now();
        let processing = match self
            .jobs
            .update(
                job_id,
                Precondition::at_attempt(job.status, claimed_attempt),
                Box::new(move |j| {
                    j.status = JobStatus::Processing;
                    j.next_run_at = None;
                    j.updated_at = now;
                }),
            )
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                info!(job_id = %job_id, error = %e, "Lost claim race, abandoning job");
                return Ok(self.abandon(job_id, AbandonReason::Conflict));
            }
            Err(e) => return Err(e),
        };

        info!(
            job_id = %job_id,
            attempt = claimed_attempt + 1,
            max_retries = processing.max_retries,
            recipients = processing.recipients.len(),
            "Processing notification job"
        );

        let result = self.execute_with_heartbeat(&processing).await;
        let finished_at = self.clock.now();
        let transition = self.policy.decide(&processing, &result, finished_at);

        let persisted = self
            .persist(job_id, claimed_attempt, &transition, finished_at)
            .await?;
        let Some(updated) = persisted else {
            warn!(
                job_id = %job_id,
                attempt = claimed_attempt + 1,
                "Job changed while fan-out was running, discarding result"
            );
            return Ok(self.abandon(job_id, AbandonReason::Superseded));
        };

        self.apply_side_effects(&updated, &transition, finished_at)
            .await?;
        self.queue.release(job_id).await?;

        let outcome = ProcessOutcome::from_transition(&transition);
        metrics::job_finished(outcome.label(), started.elapsed());
        self.log_transition(&updated, &transition);
        Ok(outcome)
    }

    /// Run the fan-out while renewing the claim lease, so a pass that outlasts
    /// the lease is not reclaimed as if its worker had crashed.
    async fn execute_with_heartbeat(&self, job: &NotificationJob) -> FanOutResult {
        let pass = self.executor.execute(job);
        let (Some(lease), Some(interval)) = (self.config.lease, self.config.heartbeat_interval())
        else {
            return pass.await;
        };

        tokio::pin!(pass);
        tokio::select! {
            biased;
            result = &mut pass => result,
            () = self.keep_lease(&job.id, lease, interval) => pass.await,
        }
    }

    /// Renew the lease every `interval`; returns only once the lease is gone.
    ///
    /// The cadence follows the runtime timer, the deadlines follow the clock.
    async fn keep_lease(&self, job_id: &JobId, lease: Duration, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let until = add_duration(self.clock.now(), lease);
            match self.queue.renew_lease(job_id, until).await {
                Ok(true) => debug!(job_id = %job_id, lease_until = %until, "Lease renewed"),
                Ok(false) => {
                    warn!(job_id = %job_id, "Lease lost while fan-out was running");
                    return;
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to renew lease"),
            }
        }
    }

    /// Write a transition fenced on `processing` at the claimed attempt.
    /// `Ok(None)` means the record moved on and the transition was dropped.
    async fn persist(
        &self,
        job_id: &JobId,
        claimed_attempt: u32,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> NotificationResult<Option<NotificationJob>> {
        let to_apply = transition.clone();
        let result = self
            .jobs
            .update(
                job_id,
                Precondition::at_attempt(JobStatus::Processing, claimed_attempt),
                Box::new(move |j| to_apply.apply(j, now)),
            )
            .await;

        match result {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Queue-side effects of a persisted transition.
    ///
    /// If any of these fail the lease is kept, so the reaper repairs the
    /// queue structures later.
    async fn apply_side_effects(
        &self,
        job: &NotificationJob,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> NotificationResult<()> {
        match transition {
            Transition::Retry { next_run_at, .. } => {
                self.queue.enqueue_delayed(&job.id, *next_run_at).await?;
                metrics::job_retried();
            }
            Transition::DeadLetter { failure, .. } => {
                self.queue
                    .enqueue_dead_letter(&DeadLetterEntry {
                        job: job.clone(),
                        dead_lettered_at: now,
                        reason: DeadLetterReason::RetriesExhausted,
                        error: failure.clone(),
                    })
                    .await?;
                metrics::job_dead_lettered(&DeadLetterReason::RetriesExhausted.to_string());
            }
            Transition::Succeed { .. } | Transition::Fail { .. } => {}
        }
        Ok(())
    }

    async fn reap_if_due(&self) -> NotificationResult<()> {
        if self.config.lease.is_none() {
            return Ok(());
        }

        let now = self.clock.now();
        {
            let mut last = self.last_reap.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *last
                && add_duration(previous, self.config.reap_interval) > now
            {
                return Ok(());
            }
            *last = Some(now);
        }

        self.reclaim_expired().await.map(|_| ())
    }

    /// Recover jobs whose lease expired, typically because a worker crashed.
    ///
    /// - `processing`: the lost pass counts as a failed attempt.
    /// - `queued`: the claim was lost before processing began; back to ready.
    /// - `retry_scheduled` / `dead_lettered`: repair a missing delayed or
    ///   dead-letter entry.
    pub async fn reclaim_expired(&self) -> NotificationResult<usize> {
        let now = self.clock.now();
        let expired = self.queue.reclaim_expired(now).await?;

        for job_id in &expired {
            let job = match self.jobs.get(job_id).await {
                Ok(job) => job,
                Err(NotificationError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            match job.status {
                JobStatus::Processing => self.fail_expired_pass(&job, now).await?,
                JobStatus::Queued => self.queue.enqueue_ready(job_id).await?,
                JobStatus::RetryScheduled => {
                    let ready_at = job.next_run_at.unwrap_or(now);
                    self.queue.enqueue_delayed(job_id, ready_at).await?;
                }
                JobStatus::DeadLettered => {
                    if self.queue.get_dead_letter(job_id).await?.is_none() {
                        let error = job.last_error.clone().unwrap_or_else(|| {
                            JobFailure::job_level(job.attempt, "retry budget exhausted", now)
                        });
                        self.queue
                            .enqueue_dead_letter(&DeadLetterEntry {
                                job: job.clone(),
                                dead_lettered_at: now,
                                reason: DeadLetterReason::RetriesExhausted,
                                error,
                            })
                            .await?;
                    }
                }
                JobStatus::Succeeded | JobStatus::Failed => {}
            }
        }

        if !expired.is_empty() {
            info!(
                worker_id = %self.config.worker_id,
                count = expired.len(),
                "Reclaimed expired leases"
            );
        }
        Ok(expired.len())
    }

    async fn fail_expired_pass(
        &self,
        job: &NotificationJob,
        now: DateTime<Utc>,
    ) -> NotificationResult<()> {
        let failure = JobFailure::job_level(job.attempt + 1, "lease expired", now);
        let transition = self.policy.decide_failure(job, failure, now);

        let Some(updated) = self.persist(&job.id, job.attempt, &transition, now).await? else {
            debug!(job_id = %job.id, "Expired job already advanced, skipping");
            return Ok(());
        };

        self.apply_side_effects(&updated, &transition, now).await?;
        metrics::lease_reclaimed();
        warn!(
            job_id = %job.id,
            attempt = updated.attempt,
            status = %updated.status,
            "Lease expired mid-pass, counted as failed attempt"
        );
        Ok(())
    }

    fn abandon(&self, job_id: &JobId, reason: AbandonReason) -> ProcessOutcome {
        metrics::claim_abandoned(&reason.to_string());
        debug!(job_id = %job_id, reason = %reason, "Abandoned claimed job");
        ProcessOutcome::Abandoned(reason)
    }

    fn log_transition(&self, job: &NotificationJob, transition: &Transition) {
        match transition {
            Transition::Succeed { attempt } => {
                info!(job_id = %job.id, attempt, "Notification job succeeded")
            }
            Transition::Retry {
                attempt,
                delay,
                next_run_at,
                failure,
            } => warn!(
                job_id = %job.id,
                attempt,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                next_run_at = %next_run_at,
                failed = failure.recipients.len(),
                "Notification job failed, retry scheduled"
            ),
            Transition::DeadLetter { attempt, failure } => error!(
                job_id = %job.id,
                attempt,
                error = %failure.summary,
                "Notification job exhausted retries, moved to dead letters"
            ),
            Transition::Fail { attempt, failure } => error!(
                job_id = %job.id,
                attempt,
                error = %failure.summary,
                "Notification job failed permanently"
            ),
        }
    }
}

/// Exponential backoff after consecutive store errors, capped at 30s.
fn error_backoff(base: Duration, consecutive_errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_errors.min(5));
    base.max(Duration::from_millis(100))
        .saturating_mul(factor)
        .min(MAX_ERROR_BACKOFF)
}
