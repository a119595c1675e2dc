//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub device_id: String,
    pub database: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match sqlx::query("SELECT 1").execute(state.db()).await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!("Health check database ping failed: {}", e);
            "unavailable"
        }
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "memory-sync",
        device_id: state.config().device.id.clone(),
        database,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{send, test_app};
    use crate::storage::MemoryRemoteStore;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_reports_device() {
        let app = test_app(&MemoryRemoteStore::new()).await;

        for uri in ["/health", "/api/v1/health"] {
            let (status, body) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["device_id"], "device-test");
            assert_eq!(body["database"], "ok");
        }
    }
}
