//! Prometheus metrics for the fan-out pipeline.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::QueueStats;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Subsequent calls return the existing handle. Returns `None` when another
/// recorder was already installed by someone else.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .ok()
}

/// Render metrics in Prometheus text format; `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn job_submitted() {
    counter!("fanout_jobs_submitted_total").increment(1);
}

/// Record a pass that ended in `outcome` (succeeded, retry_scheduled, ...).
pub fn job_finished(outcome: &str, duration: Duration) {
    counter!("fanout_jobs_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("fanout_job_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn delivery(deliverer: &'static str, result: &str) {
    counter!(
        "fanout_deliveries_total",
        "deliverer" => deliverer,
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn job_retried() {
    counter!("fanout_jobs_retried_total").increment(1);
}

pub fn job_dead_lettered(reason: &str) {
    counter!("fanout_dead_letters_total", "reason" => reason.to_string()).increment(1);
}

pub fn claim_abandoned(reason: &str) {
    counter!("fanout_claims_abandoned_total", "reason" => reason.to_string()).increment(1);
}

pub fn lease_reclaimed() {
    counter!("fanout_leases_reclaimed_total").increment(1);
}

pub fn jobs_promoted(count: usize) {
    counter!("fanout_jobs_promoted_total").increment(count as u64);
}

pub fn dead_letter_resubmitted() {
    counter!("fanout_dead_letters_resubmitted_total").increment(1);
}

pub fn queue_depths(stats: &QueueStats) {
    gauge!("fanout_queue_depth", "queue" => "ready").set(stats.ready as f64);
    gauge!("fanout_queue_depth", "queue" => "delayed").set(stats.delayed as f64);
    gauge!("fanout_queue_depth", "queue" => "in_flight").set(stats.in_flight as f64);
    gauge!("fanout_queue_depth", "queue" => "dead_letter").set(stats.dead_letters as f64);
}
