//! Data models for the notification fan-out pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

use crate::error::ErrorCategory;

// ============================================================================
// Identifiers and payload
// ============================================================================

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque notification payload (subject/body/type or anything else).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(pub serde_json::Value);

impl Message {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

// ============================================================================
// Job lifecycle
// ============================================================================

/// Job lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    RetryScheduled,
    Succeeded,
    Failed,
    DeadLettered,
}

impl JobStatus {
    /// Terminal records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::DeadLettered
        )
    }

    /// States from which a worker may move the job to `processing`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::RetryScheduled)
    }
}

/// One recipient that failed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecipient {
    pub recipient: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Aggregate failure summary of the last unsuccessful pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Attempt number the failure belongs to (1-based).
    pub attempt: u32,
    pub summary: String,
    #[serde(default)]
    pub recipients: Vec<FailedRecipient>,
    pub recorded_at: DateTime<Utc>,
}

impl JobFailure {
    /// A failure not tied to individual recipients (expired lease, cancellation).
    pub fn job_level(attempt: u32, summary: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            attempt,
            summary: summary.into(),
            recipients: Vec::new(),
            recorded_at,
        }
    }

    pub fn all_permanent(&self) -> bool {
        !self.recipients.is_empty()
            && self
                .recipients
                .iter()
                .all(|r| r.category == ErrorCategory::Permanent)
    }
}

/// A notification job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: JobId,
    pub recipients: Vec<String>,
    pub message: Message,
    /// Fan-out passes already made.
    pub attempt: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub status: JobStatus,
    /// Only meaningful while `status == RetryScheduled`.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Managed by the job store; bumped on every successful update.
    #[serde(default)]
    pub version: u64,
}

impl NotificationJob {
    pub fn new(
        id: JobId,
        recipients: Vec<String>,
        message: Message,
        max_retries: u32,
        base_delay: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            recipients,
            message,
            attempt: 0,
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            status: JobStatus::Queued,
            next_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Why a job landed in the dead-letter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    Cancelled,
}

/// Snapshot of a job at the moment it was dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: NotificationJob,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
    pub error: JobFailure,
}

impl DeadLetterEntry {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }
}

// ============================================================================
// Store contracts
// ============================================================================

/// Expected prior state carried by every optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    pub status: JobStatus,
    /// Fencing token: the attempt count the caller observed.
    pub attempt: Option<u32>,
}

impl Precondition {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            attempt: None,
        }
    }

    pub fn at_attempt(status: JobStatus, attempt: u32) -> Self {
        Self {
            status,
            attempt: Some(attempt),
        }
    }

    pub fn matches(&self, job: &NotificationJob) -> bool {
        job.status == self.status && self.attempt.is_none_or(|a| a == job.attempt)
    }
}

/// Filter for listing job records in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

impl JobFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            status: None,
            cursor: None,
            limit,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

pub(crate) fn default_page_size() -> usize {
    20
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` on the last page.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Depths of the queue structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead_letters: u64,
}

// ============================================================================
// Fan-out results
// ============================================================================

/// Failure detail for one recipient in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub category: ErrorCategory,
    pub message: String,
}

/// Outcome of one recipient delivery in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub recipient: String,
    pub success: bool,
    pub error: Option<DeliveryFailure>,
}

impl RecipientOutcome {
    pub fn delivered(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(recipient: impl Into<String>, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            success: false,
            error: Some(DeliveryFailure {
                category,
                message: message.into(),
            }),
        }
    }
}

/// Aggregate result of one fan-out pass: one outcome per recipient, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutResult {
    pub outcomes: Vec<RecipientOutcome>,
    pub all_succeeded: bool,
}

impl FanOutResult {
    pub fn from_outcomes(outcomes: Vec<RecipientOutcome>) -> Self {
        let all_succeeded = outcomes.iter().all(|o| o.success);
        Self {
            outcomes,
            all_succeeded,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecipientOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    /// Summarize the failed recipients of this pass.
    pub fn to_failure(&self, attempt: u32, recorded_at: DateTime<Utc>) -> JobFailure {
        let recipients: Vec<FailedRecipient> = self
            .failures()
            .map(|o| {
                let (category, message) = match &o.error {
                    Some(err) => (err.category, err.message.clone()),
                    None => (ErrorCategory::Transient, "unknown error".to_string()),
                };
                FailedRecipient {
                    recipient: o.recipient.clone(),
                    category,
                    message,
                }
            })
            .collect();

        JobFailure {
            attempt,
            summary: format!(
                "{} of {} recipients failed",
                recipients.len(),
                self.outcomes.len()
            ),
            recipients,
            recorded_at,
        }
    }
}

// ============================================================================
// Ingress DTOs
// ============================================================================

fn validate_recipients(recipients: &[String]) -> Result<(), validator::ValidationError> {
    if recipients.iter().any(|r| r.trim().is_empty()) {
        return Err(validator::ValidationError::new("blank_recipient"));
    }
    Ok(())
}

/// Request to fan a message out to a set of recipients.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewNotification {
    #[validate(length(min = 1), custom(function = "validate_recipients"))]
    pub recipients: Vec<String>,
    pub message: Message,
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub job_id: Option<String>,
    #[serde(default)]
    #[validate(range(max = 50))]
    pub max_retries: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub base_delay_ms: Option<u64>,
}

impl NewNotification {
    pub fn new(recipients: Vec<String>, message: serde_json::Value) -> Self {
        Self {
            recipients,
            message: Message(message),
            job_id: None,
            max_retries: None,
            base_delay_ms: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = Some(base_delay_ms);
        self
    }
}

/// Status query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_retries: u32,
    pub recipients: usize,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&NotificationJob> for JobStatusView {
    fn from(job: &NotificationJob) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            attempt: job.attempt,
            max_retries: job.max_retries,
            recipients: job.recipients.len(),
            next_run_at: job.next_run_at,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
