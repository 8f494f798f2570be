//! Simulated transport used by the demo worker and load tests.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_duration_ms, env_parse};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use super::Deliverer;
use crate::error::DeliveryError;
use crate::models::Message;

/// Behaviour of the simulated transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDelivererConfig {
    /// Probability in `[0, 1]` that a delivery succeeds.
    pub success_rate: f64,
    pub latency: Duration,
}

impl Default for SimulatedDelivererConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.95,
            latency: Duration::from_millis(100),
        }
    }
}

impl SimulatedDelivererConfig {
    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl FromEnv for SimulatedDelivererConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let success_rate = env_parse("SIMULATED_SUCCESS_RATE", defaults.success_rate)?;
        if !(0.0..=1.0).contains(&success_rate) {
            return Err(ConfigError::ParseError {
                key: "SIMULATED_SUCCESS_RATE".to_string(),
                details: format!("{success_rate} is not within [0, 1]"),
            });
        }

        Ok(Self {
            success_rate,
            latency: env_duration_ms("SIMULATED_LATENCY_MS", defaults.latency)?,
        })
    }
}

/// Sleeps for a fixed latency, then succeeds with the configured probability.
/// Failures are transient.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDeliverer {
    config: SimulatedDelivererConfig,
}

impl SimulatedDeliverer {
    pub fn new(config: SimulatedDelivererConfig) -> Self {
        let success_rate = config.success_rate.clamp(0.0, 1.0);
        Self {
            config: SimulatedDelivererConfig {
                success_rate,
                ..config
            },
        }
    }
}

#[async_trait]
impl Deliverer for SimulatedDeliverer {
    async fn deliver(&self, recipient: &str, _message: &Message) -> Result<(), DeliveryError> {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let delivered = rand::rng().random_bool(self.config.success_rate);
        if delivered {
            debug!(recipient = %recipient, "Simulated delivery succeeded");
            Ok(())
        } else {
            Err(DeliveryError::transient(format!(
                "simulated delivery to {recipient} failed"
            )))
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
