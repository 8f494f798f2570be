//! Pipeline and worker configuration.

use core_config::{
    ConfigError, FromEnv, env_duration_ms, env_or_default, env_parse, env_parse_optional,
};
use std::time::Duration;
use uuid::Uuid;

use crate::executor::DispatchMode;
use crate::scheduler::{PermanentFailurePolicy, RetryPolicy};

/// Settings shared by ingress and workers.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Redis key namespace.
    pub key_prefix: String,
    /// Budget applied when a submission does not carry its own.
    pub default_max_retries: u32,
    pub default_base_delay: Duration,
    pub retry: RetryPolicy,
    pub dispatch: DispatchMode,
    pub delivery_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "notifications".to_string(),
            default_max_retries: 3,
            default_base_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            dispatch: DispatchMode::default(),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_default_base_delay(mut self, delay: Duration) -> Self {
        self.default_base_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

fn parse_error(key: &str, details: String) -> ConfigError {
    ConfigError::ParseError {
        key: key.to_string(),
        details,
    }
}

impl FromEnv for PipelineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_delay = env_parse_optional::<u64>("FANOUT_MAX_DELAY_MS")?.map(Duration::from_millis);
        let permanent_failures: PermanentFailurePolicy =
            env_or_default("FANOUT_PERMANENT_FAILURES", "count")
                .parse()
                .map_err(|e| parse_error("FANOUT_PERMANENT_FAILURES", e))?;

        let max_in_flight = env_parse("FANOUT_MAX_IN_FLIGHT", 8usize)?;
        let dispatch = DispatchMode::parse(&env_or_default("FANOUT_DISPATCH", "parallel"), max_in_flight)
            .map_err(|e| parse_error("FANOUT_DISPATCH", e))?;

        Ok(Self {
            key_prefix: env_or_default("FANOUT_KEY_PREFIX", &defaults.key_prefix),
            default_max_retries: env_parse("FANOUT_MAX_RETRIES", defaults.default_max_retries)?,
            default_base_delay: env_duration_ms("FANOUT_BASE_DELAY_MS", defaults.default_base_delay)?,
            retry: RetryPolicy {
                max_delay,
                permanent_failures,
            },
            dispatch,
            delivery_timeout: env_duration_ms("FANOUT_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout)?,
        })
    }
}

/// Settings of one worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Identifier used in logs (auto-generated if not provided).
    pub worker_id: String,
    /// Idle wait when no ready job was claimed.
    pub poll_interval: Duration,
    /// Max delayed jobs promoted per tick.
    pub promote_batch: usize,
    /// Claim lease; `None` disables crash recovery.
    pub lease: Option<Duration>,
    /// Lease renewal period while a pass runs. Defaults to a third of the lease.
    pub heartbeat: Option<Duration>,
    /// How often expired leases are reclaimed.
    pub reap_interval: Duration,
    /// Worker loops per process.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(500),
            promote_batch: 100,
            lease: Some(Duration::from_secs(300)),
            heartbeat: None,
            reap_interval: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_promote_batch(mut self, batch: usize) -> Self {
        self.promote_batch = batch.max(1);
        self
    }

    /// A zero lease disables leases.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = (!lease.is_zero()).then_some(lease);
        self
    }

    pub fn without_lease(mut self) -> Self {
        self.lease = None;
        self
    }

    /// A zero interval falls back to the default of a third of the lease.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = (!interval.is_zero()).then_some(interval);
        self
    }

    /// How often an in-flight lease is renewed, if leases are enabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        let lease = self.lease?;
        let interval = self.heartbeat.unwrap_or(lease / 3);
        Some(interval.max(Duration::from_millis(1)))
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Copy of this config for the `index`-th loop of a process.
    pub fn for_loop(&self, index: usize) -> Self {
        Self {
            worker_id: format!("{}-{}", self.worker_id, index),
            ..self.clone()
        }
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lease = env_duration_ms("FANOUT_LEASE_MS", Duration::from_secs(300))?;

        Ok(defaults
            .clone()
            .with_poll_interval(env_duration_ms("FANOUT_POLL_INTERVAL_MS", defaults.poll_interval)?)
            .with_promote_batch(env_parse("FANOUT_PROMOTE_BATCH", defaults.promote_batch)?)
            .with_lease(lease)
            .with_heartbeat(env_duration_ms("FANOUT_HEARTBEAT_MS", Duration::ZERO)?)
            .with_reap_interval(env_duration_ms("FANOUT_REAP_INTERVAL_MS", defaults.reap_interval)?)
            .with_concurrency(env_parse("WORKER_CONCURRENCY", defaults.concurrency)?))
    }
}
