//! Fan-out executor: one delivery per recipient, every recipient attempted
//! exactly once per pass, one outcome per recipient in recipient order.

use futures::stream::{self, StreamExt};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::metrics;
use crate::models::{FanOutResult, Message, NotificationJob, RecipientOutcome};
use crate::providers::Deliverer;

/// Recipient concurrency within a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sequential,
    Parallel { max_in_flight: usize },
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Parallel { max_in_flight: 8 }
    }
}

impl DispatchMode {
    /// Parse `parallel` / `sequential`; `max_in_flight` applies to parallel.
    pub fn parse(kind: &str, max_in_flight: usize) -> Result<Self, String> {
        match kind.to_ascii_lowercase().as_str() {
            "sequential" => Ok(DispatchMode::Sequential),
            "parallel" => Ok(DispatchMode::Parallel {
                max_in_flight: max_in_flight.max(1),
            }),
            other => Err(format!(
                "unknown dispatch mode '{other}' (expected 'parallel' or 'sequential')"
            )),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, 8)
    }
}

pub struct FanOutExecutor {
    deliverer: Arc<dyn Deliverer>,
    mode: DispatchMode,
    delivery_timeout: Duration,
}

impl FanOutExecutor {
    pub fn new(deliverer: Arc<dyn Deliverer>) -> Self {
        Self {
            deliverer,
            mode: DispatchMode::default(),
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Run one pass over every recipient of `job`.
    ///
    /// A failing recipient never stops the others; failures are collected into
    /// the result rather than returned.
    pub async fn execute(&self, job: &NotificationJob) -> FanOutResult {
        let outcomes = match self.mode {
            DispatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(job.recipients.len());
                for recipient in &job.recipients {
                    outcomes.push(self.deliver_one(recipient, &job.message).await);
                }
                outcomes
            }
            DispatchMode::Parallel { max_in_flight } => {
                let message = &job.message;
                stream::iter(job.recipients.clone())
                    .map(|recipient| async move { self.deliver_one(&recipient, message).await })
                    .buffered(max_in_flight.max(1))
                    .collect::<Vec<_>>()
                    .await
            }
        };

        let result = FanOutResult::from_outcomes(outcomes);
        debug!(
            job_id = %job.id,
            recipients = job.recipients.len(),
            delivered = result.succeeded_count(),
            all_succeeded = result.all_succeeded,
            "Fan-out pass complete"
        );
        result
    }

    async fn deliver_one(&self, recipient: &str, message: &Message) -> RecipientOutcome {
        let attempt = tokio::time::timeout(
            self.delivery_timeout,
            self.deliverer.deliver(recipient, message),
        )
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(
                self.delivery_timeout.as_millis() as u64,
            )),
        };

        match result {
            Ok(()) => {
                metrics::delivery(self.deliverer.name(), "delivered");
                RecipientOutcome::delivered(recipient)
            }
            Err(e) => {
                let category = e.category();
                metrics::delivery(self.deliverer.name(), &category.to_string());
                warn!(
                    recipient = %recipient,
                    deliverer = self.deliverer.name(),
                    category = %category,
                    error = %e,
                    "Recipient delivery failed"
                );
                RecipientOutcome::failed(recipient, category, e.to_string())
            }
        }
    }
}
