//! Notification fan-out domain.
//!
//! Accepts a message plus a list of recipients, delivers it to every
//! recipient concurrently, retries failed passes with exponential backoff and
//! dead-letters jobs whose retry budget is exhausted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   HTTP handlers  │  ← POST /notifications, status, cancel, DLQ admin
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ NotificationSvc  │  ← creates the job record, pushes it onto ready
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ JobStore +       │  ← Redis (hash per job, list/zsets, DLQ stream)
//! │ QueueStore       │    or in-memory for tests
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ Worker loops     │  ← promote due retries, claim, fan out, decide
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ Deliverer        │  ← one call per recipient
//! └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{NewNotification, NotificationService};
//!
//! let job_id = service
//!     .submit(NewNotification::new(vec!["a@example.com".into()], json!({"subject": "hi"})))
//!     .await?;
//! ```

pub mod clock;
pub mod config;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, WorkerConfig};
pub use dlq::DeadLetterInspector;
pub use error::{DeliveryError, ErrorCategory, NotificationError, NotificationResult};
pub use executor::{DispatchMode, FanOutExecutor};
pub use handlers::AppState;
pub use models::*;
pub use providers::{Deliverer, SimulatedDeliverer, SimulatedDelivererConfig};
pub use scheduler::{PermanentFailurePolicy, RetryPolicy, Transition};
pub use service::{JobDefaults, NotificationService};
pub use store::{
    JobMutation, JobStore, MemoryJobStore, MemoryQueueStore, QueueStore, RedisJobStore,
    RedisKeys, RedisQueueStore,
};
pub use worker::{AbandonReason, ProcessOutcome, TickOutcome, Worker};
