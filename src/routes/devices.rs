//! Device registry API routes

use axum::{extract::State, routing::get, Json, Router};
use serde::Deserialize;

use crate::db::DeviceCursor;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::validate_segment;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_devices).post(register_device))
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub platform: Option<String>,
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceCursor>>> {
    let devices = state.service().list_devices().await?;
    Ok(Json(devices))
}

/// Register a device, or refresh its platform if already known
async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<DeviceCursor>> {
    validate_segment("device_id", &req.device_id)?;
    let device = state
        .service()
        .register_device(&req.device_id, req.platform.as_deref())
        .await?;
    Ok(Json(device))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{send, test_app};
    use crate::storage::MemoryRemoteStore;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_list() {
        let app = test_app(&MemoryRemoteStore::new()).await;

        let (status, body) = send(&app, "POST", "/api/v1/devices", Some(json!({"device_id": "laptop", "platform": "linux"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deviceId"], "laptop");
        assert!(body["lastSync"].is_null());

        send(&app, "POST", "/api/v1/sync/pull/laptop", None).await;

        let (_, body) = send(&app, "GET", "/api/v1/devices", None).await;
        let devices = body.as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0]["lastSync"].is_string());
    }
}
