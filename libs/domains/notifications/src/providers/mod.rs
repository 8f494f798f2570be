//! Delivery providers.
//!
//! The pipeline treats "deliver to one recipient" as an opaque, possibly
//! failing operation behind the [`Deliverer`] trait. Channel specifics (email,
//! SMS, push) live in implementations.

mod simulated;

pub use simulated::{SimulatedDeliverer, SimulatedDelivererConfig};

use crate::error::DeliveryError;
use crate::models::Message;
use async_trait::async_trait;

/// Delivers a message to a single recipient.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Deliver `message` to `recipient`.
    ///
    /// Return a transient error for failures worth retrying and a permanent
    /// one for failures that will never succeed.
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError>;

    /// Provider name for logs and metric labels.
    fn name(&self) -> &'static str;
}
