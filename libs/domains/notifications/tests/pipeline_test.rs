//! End-to-end pipeline tests
//!
//! These drive the service, worker and dead-letter inspector against the
//! in-memory stores with a manual clock, so retry timing is exact and no test
//! waits in real time.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use domain_notifications::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};

/// Deliverer that fails a fixed set of recipients and counts every call.
#[derive(Default)]
struct ScriptedDeliverer {
    failing: Mutex<HashSet<String>>,
    permanent: AtomicBool,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedDeliverer {
    fn failing(recipients: &[&str]) -> Self {
        let deliverer = Self::default();
        deliverer.fail(recipients);
        deliverer
    }

    fn fail(&self, recipients: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.clear();
        failing.extend(recipients.iter().map(|r| r.to_string()));
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls(&self, recipient: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(recipient)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, recipient: &str, _message: &Message) -> Result<(), DeliveryError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(recipient.to_string())
            .or_default() += 1;

        if self.failing.lock().unwrap().contains(recipient) {
            if self.permanent.load(Ordering::SeqCst) {
                return Err(DeliveryError::permanent("mailbox does not exist"));
            }
            return Err(DeliveryError::transient("upstream unavailable"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Deliverer that parks every delivery until the gate is opened.
#[derive(Default)]
struct GatedDeliverer {
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl Deliverer for GatedDeliverer {
    async fn deliver(&self, _recipient: &str, _message: &Message) -> Result<(), DeliveryError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

/// Job store that lets another writer slip in one change right before the
/// next update lands.
struct RacingJobStore {
    inner: Arc<MemoryJobStore>,
    competing: Mutex<Option<JobMutation>>,
}

impl RacingJobStore {
    fn new(inner: Arc<MemoryJobStore>) -> Self {
        Self {
            inner,
            competing: Mutex::new(None),
        }
    }

    fn interleave(&self, mutation: JobMutation) {
        *self.competing.lock().unwrap() = Some(mutation);
    }
}

#[async_trait]
impl JobStore for RacingJobStore {
    async fn create(&self, job: NotificationJob) -> NotificationResult<JobId> {
        self.inner.create(job).await
    }

    async fn get(&self, id: &JobId) -> NotificationResult<NotificationJob> {
        self.inner.get(id).await
    }

    async fn update(
        &self,
        id: &JobId,
        expected: Precondition,
        mutation: JobMutation,
    ) -> NotificationResult<NotificationJob> {
        let competing = self.competing.lock().unwrap().take();
        if let Some(competing) = competing {
            let current = self.inner.get(id).await?;
            self.inner
                .update(
                    id,
                    Precondition::at_attempt(current.status, current.attempt),
                    competing,
                )
                .await?;
        }
        self.inner.update(id, expected, mutation).await
    }

    async fn list(&self, filter: &JobFilter) -> NotificationResult<Page<NotificationJob>> {
        self.inner.list(filter).await
    }

    async fn withdraw(&self, id: &JobId, version: u64) -> NotificationResult<bool> {
        self.inner.withdraw(id, version).await
    }
}

struct Harness {
    jobs: Arc<MemoryJobStore>,
    store: Arc<RacingJobStore>,
    queue: Arc<MemoryQueueStore>,
    clock: Arc<ManualClock>,
    deliverer: Arc<ScriptedDeliverer>,
    service: NotificationService,
    inspector: DeadLetterInspector,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

impl Harness {
    fn new(deliverer: ScriptedDeliverer) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let store = Arc::new(RacingJobStore::new(jobs.clone()));
        let queue = Arc::new(MemoryQueueStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let service = NotificationService::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            JobDefaults::default(),
        );
        let inspector = DeadLetterInspector::new(queue.clone(), service.clone(), clock.clone());

        Self {
            jobs,
            store,
            queue,
            clock,
            deliverer: Arc::new(deliverer),
            service,
            inspector,
        }
    }

    fn worker(&self, name: &str) -> Worker {
        self.worker_with(name, RetryPolicy::new())
    }

    fn worker_with(&self, name: &str, policy: RetryPolicy) -> Worker {
        self.worker_using(
            self.deliverer.clone(),
            policy,
            WorkerConfig::default().with_worker_id(name),
        )
    }

    fn worker_using(
        &self,
        deliverer: Arc<dyn Deliverer>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Worker {
        Worker::new(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(FanOutExecutor::new(deliverer)),
            policy,
            self.clock.clone(),
            config,
        )
    }

    async fn submit(&self, recipients: &[&str], max_retries: u32) -> JobId {
        self.service
            .submit(
                NewNotification::new(
                    recipients.iter().map(|r| r.to_string()).collect(),
                    json!({"subject": "hello"}),
                )
                .with_max_retries(max_retries)
                .with_base_delay_ms(1000),
            )
            .await
            .unwrap()
    }

    async fn job(&self, id: &JobId) -> NotificationJob {
        self.jobs.get(id).await.unwrap()
    }
}

async fn processed(worker: &Worker) -> ProcessOutcome {
    match worker.tick().await.unwrap() {
        TickOutcome::Processed { outcome, .. } => outcome,
        TickOutcome::Idle => panic!("expected a job to be processed"),
    }
}

#[tokio::test]
async fn test_first_pass_success_ends_succeeded() {
    let h = Harness::new(ScriptedDeliverer::default());
    let worker = h.worker("w1");
    let id = h.submit(&["a", "b", "c"], 3).await;

    assert_eq!(processed(&worker).await, ProcessOutcome::Succeeded);

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 1);
    assert!(job.last_error.is_none());
    assert!(!h.queue.is_ready(&id));
    assert!(!h.queue.is_delayed(&id));
    assert!(!h.queue.is_leased(&id));
    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn test_recipient_failing_every_pass_is_dead_lettered_after_budget() {
    let h = Harness::new(ScriptedDeliverer::failing(&["b"]));
    let worker = h.worker("w1");
    let id = h.submit(&["a", "b"], 2).await;
    let t0 = start();

    // attempt 1
    assert_eq!(
        processed(&worker).await,
        ProcessOutcome::RetryScheduled {
            next_run_at: t0 + TimeDelta::seconds(1)
        }
    );
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::RetryScheduled);
    assert_eq!(job.attempt, 1);
    assert_eq!(h.queue.delayed_until(&id), Some(t0 + TimeDelta::seconds(1)));

    // not due yet
    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);

    // attempt 2
    h.clock.advance(Duration::from_secs(1));
    let t1 = h.clock.now();
    assert_eq!(
        processed(&worker).await,
        ProcessOutcome::RetryScheduled {
            next_run_at: t1 + TimeDelta::seconds(2)
        }
    );
    assert_eq!(h.job(&id).await.attempt, 2);

    // attempt 3
    h.clock.advance(Duration::from_secs(2));
    let t2 = h.clock.now();
    assert_eq!(processed(&worker).await, ProcessOutcome::DeadLettered);

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt, 3);
    assert!(!h.queue.is_ready(&id));
    assert!(!h.queue.is_delayed(&id));

    assert_eq!(h.queue.dead_letter_count(&id), 1);
    let entry = h.inspector.get(&id).await.unwrap();
    assert_eq!(entry.reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(entry.error.attempt, 3);
    assert_eq!(entry.job.attempt, 3);
    assert!(entry.dead_lettered_at >= t2);
    assert_eq!(entry.error.recipients.len(), 1);
    assert_eq!(entry.error.recipients[0].recipient, "b");

    // each pass re-attempts every recipient
    assert_eq!(h.deliverer.calls("a"), 3);
    assert_eq!(h.deliverer.calls("b"), 3);
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let h = Harness::new(ScriptedDeliverer::failing(&["a"]));
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 4).await;

    let mut delays = Vec::new();
    loop {
        let now = h.clock.now();
        match processed(&worker).await {
            ProcessOutcome::RetryScheduled { next_run_at } => {
                let delay = next_run_at - now;
                delays.push(delay);
                h.clock.advance(delay.to_std().unwrap());
            }
            ProcessOutcome::DeadLettered => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(
        delays,
        vec![
            TimeDelta::seconds(1),
            TimeDelta::seconds(2),
            TimeDelta::seconds(4),
            TimeDelta::seconds(8),
        ]
    );
    for pair in delays.windows(2) {
        assert_eq!(pair[1], pair[0] * 2);
    }
    assert_eq!(h.job(&id).await.attempt, 5);
}

#[tokio::test]
async fn test_partial_fan_out_retries_every_recipient() {
    let h = Harness::new(ScriptedDeliverer::failing(&["r2"]));
    let worker = h.worker("w1");
    let id = h.submit(&["r1", "r2", "r3"], 3).await;

    let outcome = processed(&worker).await;
    assert!(matches!(outcome, ProcessOutcome::RetryScheduled { .. }));

    let failure = h.job(&id).await.last_error.unwrap();
    assert_eq!(failure.attempt, 1);
    assert_eq!(failure.summary, "1 of 3 recipients failed");
    assert_eq!(failure.recipients.len(), 1);
    assert_eq!(failure.recipients[0].recipient, "r2");
    assert_eq!(failure.recipients[0].category, ErrorCategory::Transient);

    h.deliverer.heal();
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(processed(&worker).await, ProcessOutcome::Succeeded);

    for recipient in ["r1", "r2", "r3"] {
        assert_eq!(h.deliverer.calls(recipient), 2, "recipient {recipient}");
    }
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 2);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn test_concurrent_claimers_each_get_a_distinct_job() {
    let queue = Arc::new(MemoryQueueStore::new());
    let jobs: Vec<JobId> = (0..8).map(|i| JobId::from(format!("job-{i}"))).collect();
    for id in &jobs {
        queue.enqueue_ready(id).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let queue = queue.clone();
        handles.push(tokio::spawn(
            async move { queue.claim_ready(None).await.unwrap() },
        ));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            claimed.push(id);
        }
    }

    claimed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    let mut expected = jobs.clone();
    expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(claimed, expected);
}

#[tokio::test]
async fn test_two_claimers_one_job() {
    let queue = Arc::new(MemoryQueueStore::new());
    queue.enqueue_ready(&JobId::from("only")).await.unwrap();

    let (a, b) = tokio::join!(queue.claim_ready(None), queue.claim_ready(None));
    let results = [a.unwrap(), b.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    assert!(results.contains(&Some(JobId::from("only"))));
}

#[tokio::test]
async fn test_two_workers_process_each_job_once() {
    let h = Harness::new(ScriptedDeliverer::default());
    let w1 = h.worker("w1");
    let w2 = h.worker("w2");

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(h.submit(&[&format!("user-{i}")], 3).await);
    }

    loop {
        let (a, b) = tokio::join!(w1.tick(), w2.tick());
        if a.unwrap() == TickOutcome::Idle && b.unwrap() == TickOutcome::Idle {
            break;
        }
    }

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(h.job(id).await.status, JobStatus::Succeeded);
        assert_eq!(h.deliverer.calls(&format!("user-{i}")), 1);
    }
}

#[tokio::test]
async fn test_expired_lease_counts_as_failed_attempt() {
    let h = Harness::new(ScriptedDeliverer::default());
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 3).await;

    // a worker claims and marks the job processing, then disappears
    let lease_until = h.clock.now() + TimeDelta::seconds(30);
    assert_eq!(
        h.queue.claim_ready(Some(lease_until)).await.unwrap(),
        Some(id.clone())
    );
    h.jobs
        .update(
            &id,
            Precondition::at_attempt(JobStatus::Queued, 0),
            Box::new(|j| j.status = JobStatus::Processing),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(29));
    assert_eq!(worker.reclaim_expired().await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(worker.reclaim_expired().await.unwrap(), 1);

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::RetryScheduled);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.last_error.unwrap().summary, "lease expired");
    assert!(h.queue.is_delayed(&id));
    assert!(!h.queue.is_leased(&id));

    // the recovered job then completes normally
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(processed(&worker).await, ProcessOutcome::Succeeded);
    assert_eq!(h.job(&id).await.attempt, 2);
}

#[tokio::test]
async fn test_cancel_scheduled_retry_removes_it_from_queues() {
    let h = Harness::new(ScriptedDeliverer::failing(&["a"]));
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 3).await;

    processed(&worker).await;
    assert!(h.queue.is_delayed(&id));

    let cancelled = h.service.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::DeadLettered);
    assert!(!h.queue.is_delayed(&id));

    h.clock.advance(Duration::from_secs(60));
    assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(h.deliverer.calls("a"), 1);

    let entry = h.inspector.get(&id).await.unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Cancelled);
}

#[tokio::test]
async fn test_resubmitted_dead_letter_runs_as_new_job() {
    let h = Harness::new(ScriptedDeliverer::failing(&["a"]));
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 0).await;

    assert_eq!(processed(&worker).await, ProcessOutcome::DeadLettered);

    h.deliverer.heal();
    let new_id = h.inspector.resubmit(&id).await.unwrap();
    assert_ne!(new_id, id);
    assert_eq!(processed(&worker).await, ProcessOutcome::Succeeded);

    assert_eq!(h.job(&new_id).await.status, JobStatus::Succeeded);
    assert_eq!(h.job(&id).await.status, JobStatus::DeadLettered);
    assert_eq!(h.inspector.stats().await.unwrap().dead_letters, 1);
}

#[tokio::test]
async fn test_permanent_failures_fail_immediately_when_configured() {
    let deliverer = ScriptedDeliverer::failing(&["gone"]);
    deliverer.permanent.store(true, Ordering::SeqCst);
    let h = Harness::new(deliverer);
    let worker = h.worker_with(
        "w1",
        RetryPolicy::new().with_permanent_failures(PermanentFailurePolicy::FailImmediately),
    );
    let id = h.submit(&["gone"], 3).await;

    assert_eq!(processed(&worker).await, ProcessOutcome::Failed);

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 1);
    assert!(h.inspector.get(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_permanent_failures_use_shared_budget_by_default() {
    let deliverer = ScriptedDeliverer::failing(&["gone"]);
    deliverer.permanent.store(true, Ordering::SeqCst);
    let h = Harness::new(deliverer);
    let worker = h.worker("w1");
    h.submit(&["gone"], 1).await;

    assert!(matches!(
        processed(&worker).await,
        ProcessOutcome::RetryScheduled { .. }
    ));
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(processed(&worker).await, ProcessOutcome::DeadLettered);
}

#[tokio::test]
async fn test_worker_run_processes_until_shutdown() {
    let h = Harness::new(ScriptedDeliverer::default());
    let worker = Arc::new(h.worker("w1"));
    let id = h.submit(&["a", "b"], 3).await;

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    for _ in 0..200 {
        if h.job(&id).await.status == JobStatus::Succeeded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.job(&id).await.status, JobStatus::Succeeded);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_job_cancelled_after_claim_is_not_delivered() {
    let h = Harness::new(ScriptedDeliverer::default());
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 3).await;

    // claim, then cancel before the worker processes the claim
    let claimed = h.queue.claim_ready(None).await.unwrap().unwrap();
    h.service.cancel(&id).await.unwrap();

    let outcome = worker.process_claimed(&claimed).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Abandoned(AbandonReason::Terminal));
    assert_eq!(h.job(&id).await.status, JobStatus::DeadLettered);
    assert_eq!(h.deliverer.calls("a"), 0);
}

#[tokio::test]
async fn test_worker_losing_processing_race_does_not_deliver() {
    let h = Harness::new(ScriptedDeliverer::default());
    let worker = h.worker("w1");
    let id = h.submit(&["a"], 3).await;

    // another worker marks the job processing between our read and our write
    h.store
        .interleave(Box::new(|j| j.status = JobStatus::Processing));

    assert_eq!(
        processed(&worker).await,
        ProcessOutcome::Abandoned(AbandonReason::Conflict)
    );
    assert_eq!(h.deliverer.calls("a"), 0);
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt, 0);
}

#[tokio::test]
async fn test_cancel_during_pass_discards_its_result() {
    let h = Harness::new(ScriptedDeliverer::default());
    let gated = Arc::new(GatedDeliverer::default());
    let worker = Arc::new(h.worker_using(
        gated.clone(),
        RetryPolicy::new(),
        WorkerConfig::default().with_worker_id("w1"),
    ));
    let id = h.submit(&["a"], 3).await;

    let pass = tokio::spawn({
        let worker = worker.clone();
        async move { worker.tick().await }
    });
    gated.entered.notified().await;
    assert_eq!(h.job(&id).await.status, JobStatus::Processing);

    let cancelled = h.service.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::DeadLettered);
    gated.gate.notify_one();

    assert_eq!(
        pass.await.unwrap().unwrap(),
        TickOutcome::Processed {
            job_id: id.clone(),
            outcome: ProcessOutcome::Abandoned(AbandonReason::Superseded),
        }
    );
    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt, 0);
    assert_eq!(h.queue.dead_letter_count(&id), 1);
    assert_eq!(
        h.inspector.get(&id).await.unwrap().reason,
        DeadLetterReason::Cancelled
    );
}

#[tokio::test]
async fn test_lease_is_renewed_while_pass_outlasts_it() {
    let h = Harness::new(ScriptedDeliverer::default());
    let gated = Arc::new(GatedDeliverer::default());
    let slow = Arc::new(h.worker_using(
        gated.clone(),
        RetryPolicy::new(),
        WorkerConfig::default()
            .with_worker_id("w1")
            .with_lease(Duration::from_secs(300))
            .with_heartbeat(Duration::from_millis(10)),
    ));
    let reaper = h.worker("w2");
    let id = h.submit(&["a"], 3).await;

    let pass = tokio::spawn({
        let slow = slow.clone();
        async move { slow.tick().await }
    });
    gated.entered.notified().await;

    // the pass is still running long after the original lease deadline
    h.clock.advance(Duration::from_secs(301));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reaper.reclaim_expired().await.unwrap(), 0);
    assert!(h.queue.is_leased(&id));

    gated.gate.notify_one();
    assert_eq!(
        pass.await.unwrap().unwrap(),
        TickOutcome::Processed {
            job_id: id.clone(),
            outcome: ProcessOutcome::Succeeded,
        }
    );

    let job = h.job(&id).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 1);
    assert!(job.last_error.is_none());
    assert!(!h.queue.is_leased(&id));
}

#[tokio::test]
async fn test_cancel_retries_after_losing_race_to_worker() {
    let h = Harness::new(ScriptedDeliverer::default());
    let id = h.submit(&["a"], 3).await;

    // a worker moves the job to processing while the cancel is in progress
    h.store
        .interleave(Box::new(|j| j.status = JobStatus::Processing));

    let cancelled = h.service.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::DeadLettered);
    assert_eq!(h.job(&id).await.status, JobStatus::DeadLettered);
    assert!(!h.queue.is_ready(&id));
    assert_eq!(
        h.inspector.get(&id).await.unwrap().reason,
        DeadLetterReason::Cancelled
    );
}
