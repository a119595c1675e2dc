//! Memory entry API routes

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::state::AppState;
use crate::sync::{validate_segment, CleanupReport, MemoryEntry, Scope, WriteResponse};

/// Create the memory router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:scope", get(list_entries))
        .route("/:scope/cleanup", post(cleanup_entries))
        .route(
            "/:scope/:key",
            get(get_entry).put(set_entry).delete(delete_entry),
        )
        .route("/:scope/:key/restore", post(restore_entry))
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetEntryRequest {
    pub value: Value,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub reason: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    pub keys: Vec<String>,
    pub reason: String,
    pub actor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    #[serde(flatten)]
    pub report: CleanupReport,
    pub writes: Vec<WriteResponse>,
}

/// Writes without an explicit actor are attributed to this device
fn actor_or_device(state: &AppState, actor: Option<String>) -> String {
    actor.unwrap_or_else(|| state.service().device_id().to_string())
}

fn parse_target(scope: &str, key: &str) -> Result<Scope> {
    let scope = Scope::parse(scope)?;
    validate_segment("key", key)?;
    Ok(scope)
}

/// List entries in a scope
async fn list_entries(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Vec<MemoryEntry>>> {
    let scope = Scope::parse(&scope)?;
    let entries = state
        .service()
        .list_entries(&scope, query.include_deleted)
        .await?;
    Ok(Json(entries))
}

async fn get_entry(
    State(state): State<AppState>,
    Path((scope, key)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<MemoryEntry>> {
    let scope = parse_target(&scope, &key)?;
    let entry = state
        .service()
        .get_entry(&scope, &key, query.include_deleted)
        .await?;
    Ok(Json(entry))
}

/// Write a value; succeeds locally even when the remote is unreachable
async fn set_entry(
    State(state): State<AppState>,
    Path((scope, key)): Path<(String, String)>,
    Json(req): Json<SetEntryRequest>,
) -> Result<Json<WriteResponse>> {
    let scope = parse_target(&scope, &key)?;
    let actor = actor_or_device(&state, req.actor);
    let outcome = state
        .service()
        .set_entry(&scope, &key, req.value, &actor)
        .await?;
    Ok(Json(WriteResponse::from(&outcome)))
}

/// Tombstone an entry
async fn delete_entry(
    State(state): State<AppState>,
    Path((scope, key)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<WriteResponse>> {
    let scope = parse_target(&scope, &key)?;
    let actor = actor_or_device(&state, query.actor);
    let outcome = state
        .service()
        .delete_entry(&scope, &key, query.reason.as_deref(), &actor)
        .await?;
    Ok(Json(WriteResponse::from(&outcome)))
}

async fn restore_entry(
    State(state): State<AppState>,
    Path((scope, key)): Path<(String, String)>,
    req: Option<Json<RestoreRequest>>,
) -> Result<Json<WriteResponse>> {
    let scope = parse_target(&scope, &key)?;
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let actor = actor_or_device(&state, req.actor);
    let outcome = state.service().restore_entry(&scope, &key, &actor).await?;
    Ok(Json(WriteResponse::from(&outcome)))
}

/// Tombstone a set of keys as one sweep
async fn cleanup_entries(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>> {
    let scope = Scope::parse(&scope)?;
    for key in &req.keys {
        validate_segment("key", key)?;
    }
    let actor = actor_or_device(&state, req.actor);

    let (report, outcomes) = state
        .service()
        .cleanup_entries(&scope, &req.keys, &req.reason, &actor)
        .await?;

    Ok(Json(CleanupResponse {
        report,
        writes: outcomes.iter().map(WriteResponse::from).collect(),
    }))
}
