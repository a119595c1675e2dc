//! Sync API endpoints
//!
//! Cycles are never scheduled internally; these endpoints are how an
//! operator or a client triggers them.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::db::OutboxItem;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::{PullReport, PushReport, RetryReport, SyncStatus};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_changes))
        .route("/pull/:device_id", post(pull_changes))
        .route("/status", get(get_sync_status))
        .route("/dead-letters/retry", post(retry_dead_letters))
        .route("/outbox/:id", get(get_outbox_item))
}

/// Drain the outbox to the remote
async fn push_changes(State(state): State<AppState>) -> Result<Json<PushReport>> {
    let report = state.service().trigger_push().await?;
    Ok(Json(report))
}

/// Pull remote changes for a device
///
/// A failed pull still answers 200; the report carries `success: false`.
async fn pull_changes(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<PullReport>> {
    let report = state.service().trigger_pull(&device_id).await?;
    Ok(Json(report))
}

async fn get_sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>> {
    let status = state.service().sync_status().await?;
    Ok(Json(status))
}

async fn retry_dead_letters(State(state): State<AppState>) -> Result<Json<RetryReport>> {
    let report = state.service().retry_dead_letters().await?;
    Ok(Json(report))
}

async fn get_outbox_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OutboxItem>> {
    let item = state.service().outbox_item(id).await?;
    Ok(Json(item))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{send, test_app};
    use crate::storage::MemoryRemoteStore;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_after_outage() {
        let remote = MemoryRemoteStore::new();
        let app = test_app(&remote).await;

        remote.set_offline(true);
        send(&app, "PUT", "/api/v1/memory/global/k", Some(json!({"value": 1}))).await;

        let (status, body) = send(&app, "POST", "/api/v1/sync/push", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["remaining"], 1);

        let (_, body) = send(&app, "GET", "/api/v1/sync/status", None).await;
        assert_eq!(body["pendingSample"][0]["retryCount"], 1);

        remote.set_offline(false);
        let (_, body) = send(&app, "POST", "/api/v1/sync/push", None).await;
        assert_eq!(body["synced"], 1);
        assert_eq!(body["remaining"], 0);
        assert_eq!(remote.document("memory_global", "k").unwrap()["value"], 1);
    }

    #[tokio::test]
    async fn test_pull_reports_failure_in_body() {
        let remote = MemoryRemoteStore::new();
        let app = test_app(&remote).await;
        remote.set_offline(true);

        let (status, body) = send(&app, "POST", "/api/v1/sync/pull/device-test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["deviceId"], "device-test");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_retry_with_no_dead_letters() {
        let app = test_app(&MemoryRemoteStore::new()).await;

        let (status, body) = send(&app, "POST", "/api/v1/sync/dead-letters/retry", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"retried": 0, "total": 0}));
    }

    #[tokio::test]
    async fn test_outbox_item_lookup() {
        let remote = MemoryRemoteStore::new();
        let app = test_app(&remote).await;
        remote.set_offline(true);
        send(&app, "PUT", "/api/v1/memory/global/k", Some(json!({"value": 1}))).await;

        let (_, status) = send(&app, "GET", "/api/v1/sync/status", None).await;
        let id = status["pendingSample"][0]["id"].as_i64().unwrap();

        let (code, item) = send(&app, "GET", &format!("/api/v1/sync/outbox/{}", id), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(item["operation"], "SET");
        assert_eq!(item["synced"], false);

        remote.set_offline(false);
        send(&app, "POST", "/api/v1/sync/push", None).await;
        let (_, item) = send(&app, "GET", &format!("/api/v1/sync/outbox/{}", id), None).await;
        assert_eq!(item["synced"], true);

        let (code, _) = send(&app, "GET", "/api/v1/sync/outbox/9999", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
