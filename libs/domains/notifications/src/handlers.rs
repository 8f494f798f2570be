//! HTTP surface: ingress, status, cancellation, dead-letter admin and the
//! health/metrics probes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dlq::DeadLetterInspector;
use crate::error::NotificationResult;
use crate::metrics;
use crate::models::{
    DeadLetterEntry, JobFilter, JobId, JobStatus, JobStatusView, NewNotification, Page, QueueStats,
    default_page_size,
};
use crate::service::NotificationService;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub service: NotificationService,
    pub inspector: DeadLetterInspector,
    pub app_name: String,
    pub app_version: String,
}

impl AppState {
    pub fn new(
        service: NotificationService,
        inspector: DeadLetterInspector,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            service,
            inspector,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/notifications",
            get(list_notifications).post(submit_notification),
        )
        .route(
            "/notifications/{id}",
            get(get_notification).delete(cancel_notification),
        )
        .route("/admin/dlq/stats", get(dlq_stats))
        .route("/admin/dlq/messages", get(dlq_list))
        .route("/admin/dlq/{id}", get(dlq_get))
        .route("/admin/dlq/{id}/resubmit", post(dlq_resubmit))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe. Always OK while the process serves requests.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe: the queue store must answer.
async fn ready_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.service.ready().await {
        Ok(()) => Ok(Json(json!({
            "status": "ready",
            "checks": { "store": "ok" }
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "store": format!("error: {}", e) }
            })),
        )),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

/// Body returned when a job is accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

async fn submit_notification(
    State(state): State<AppState>,
    Json(input): Json<NewNotification>,
) -> NotificationResult<impl IntoResponse> {
    let recipients = input.recipients.len();
    let job_id = state.service.submit(input).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            message: format!("Notification queued for {recipients} recipient(s)"),
        }),
    ))
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> NotificationResult<Json<Page<JobStatusView>>> {
    Ok(Json(state.service.list(filter).await?))
}

async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> NotificationResult<Json<JobStatusView>> {
    let view = state.service.status(&JobId::from(id)).await?;
    Ok(Json(view))
}

async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> NotificationResult<Json<JobStatusView>> {
    let job = state.service.cancel(&JobId::from(id)).await?;
    Ok(Json(JobStatusView::from(&job)))
}

// ============================================================================
// Dead-letter admin
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    pub cursor: Option<String>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

async fn dlq_stats(State(state): State<AppState>) -> NotificationResult<Json<QueueStats>> {
    Ok(Json(state.inspector.stats().await?))
}

async fn dlq_list(
    State(state): State<AppState>,
    Query(params): Query<DlqListParams>,
) -> NotificationResult<Json<Page<DeadLetterEntry>>> {
    let page = state
        .inspector
        .list(params.cursor.as_deref(), params.limit)
        .await?;
    Ok(Json(page))
}

async fn dlq_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> NotificationResult<Json<DeadLetterEntry>> {
    Ok(Json(state.inspector.get(&JobId::from(id)).await?))
}

async fn dlq_resubmit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> NotificationResult<impl IntoResponse> {
    let original = JobId::from(id);
    let job_id = state.inspector.resubmit(&original).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "resubmitted_from": original,
            "status": JobStatus::Queued,
        })),
    ))
}
