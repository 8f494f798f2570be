//! Handler tests for the notifications HTTP surface
//!
//! These verify request deserialization, status codes and error bodies. The
//! router runs over the in-memory stores, so no container is needed.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain_notifications::*;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use test_utils::TestDataBuilder;
use tower::ServiceExt; // For oneshot()

async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn app_state() -> AppState {
    let jobs = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueueStore::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let service = NotificationService::new(jobs, queue.clone(), clock.clone(), JobDefaults::default());
    let inspector = DeadLetterInspector::new(queue, service.clone(), clock);
    AppState::new(service, inspector, "fanout-worker", "0.1.0")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_submit_returns_202_with_job_id() {
    let app = handlers::router(app_state());
    let builder = TestDataBuilder::from_test_name("handler_submit_202");

    let response = app
        .oneshot(post_json(
            "/notifications",
            json!({
                "recipients": builder.recipients(3),
                "message": {"subject": "hello", "body": "world"},
                "job_id": builder.job_id("main"),
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["job_id"], builder.job_id("main"));
    assert_eq!(body["status"], "queued");
    assert!(body["message"].as_str().unwrap().contains('3'));
}

#[tokio::test]
async fn test_submit_validates_input() {
    let app = handlers::router(app_state());

    let response = app
        .oneshot(post_json(
            "/notifications",
            json!({ "recipients": [], "message": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_submit_duplicate_id_returns_409() {
    let state = app_state();
    let builder = TestDataBuilder::from_test_name("handler_duplicate");
    let payload = json!({
        "recipients": builder.recipients(1),
        "message": {},
        "job_id": builder.job_id("dup"),
    });

    let first = handlers::router(state.clone())
        .oneshot(post_json("/notifications", payload.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = handlers::router(state)
        .oneshot(post_json("/notifications", payload))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_get_status_and_unknown_job() {
    let state = app_state();
    let id = state
        .service
        .submit(NewNotification::new(vec!["a".into(), "b".into()], json!({})))
        .await
        .unwrap();

    let response = handlers::router(state.clone())
        .oneshot(request("GET", &format!("/notifications/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view: JobStatusView = json_body(response.into_body()).await;
    assert_eq!(view.job_id, id);
    assert_eq!(view.status, JobStatus::Queued);
    assert_eq!(view.recipients, 2);

    let response = handlers::router(state)
        .oneshot(request("GET", "/notifications/does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_then_inspect_and_resubmit_dead_letter() {
    let state = app_state();
    let id = state
        .service
        .submit(NewNotification::new(vec!["a".into()], json!({"k": 1})))
        .await
        .unwrap();

    let response = handlers::router(state.clone())
        .oneshot(request("DELETE", &format!("/notifications/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view: JobStatusView = json_body(response.into_body()).await;
    assert_eq!(view.status, JobStatus::DeadLettered);

    let response = handlers::router(state.clone())
        .oneshot(request("GET", "/admin/dlq/messages?limit=10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Page<DeadLetterEntry> = json_body(response.into_body()).await;
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].job_id(), &id);
    assert_eq!(page.items[0].reason, DeadLetterReason::Cancelled);
    assert!(page.next_cursor.is_none());

    let response = handlers::router(state.clone())
        .oneshot(request("GET", &format!("/admin/dlq/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = handlers::router(state.clone())
        .oneshot(request("POST", &format!("/admin/dlq/{id}/resubmit")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = json_body(response.into_body()).await;
    let new_id = JobId::from(body["job_id"].as_str().unwrap());
    assert_ne!(new_id, id);
    assert_eq!(body["resubmitted_from"], id.as_str());

    let response = handlers::router(state)
        .oneshot(request("GET", "/admin/dlq/stats"))
        .await
        .unwrap();
    let stats: QueueStats = json_body(response.into_body()).await;
    assert_eq!(stats.dead_letters, 1);
    assert_eq!(stats.ready, 1);
}

#[tokio::test]
async fn test_unknown_dead_letter_returns_404() {
    let app = handlers::router(app_state());

    let response = app
        .oneshot(request("POST", "/admin/dlq/missing/resubmit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_ready_probes() {
    let state = app_state();

    let response = handlers::router(state.clone())
        .oneshot(request("GET", "/healthz"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["name"], "fanout-worker");

    let response = handlers::router(state)
        .oneshot(request("GET", "/ready"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_list_notifications_filters_by_status() {
    let state = app_state();
    for i in 0..3 {
        let id = state
            .service
            .submit(NewNotification::new(vec![format!("user-{i}")], json!({})))
            .await
            .unwrap();
        if i == 0 {
            state.service.cancel(&id).await.unwrap();
        }
    }

    let response = handlers::router(state)
        .oneshot(request("GET", "/notifications?status=queued&limit=10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Page<JobStatusView> = json_body(response.into_body()).await;
    assert_eq!(page.items.len(), 2);
    assert!(page.items.iter().all(|v| v.status == JobStatus::Queued));
}
