//! Audit trail API routes

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::db::AuditLogEntry;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{validate_segment, Scope};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_audit))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
    pub scope: Option<String>,
    pub key: Option<String>,
}

/// Recent records, newest first, or the full history of one entry when
/// `scope` and `key` are given
async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditLogEntry>>> {
    let entries = match (query.scope, query.key) {
        (Some(scope), Some(key)) => {
            let scope = Scope::parse(&scope)?;
            validate_segment("key", &key)?;
            state.service().audit_history(&scope, &key).await?
        }
        (None, None) => {
            let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
            state.service().recent_audit(limit).await?
        }
        _ => {
            return Err(AppError::Malformed(
                "scope and key must be given together".to_string(),
            ))
        }
    };
    Ok(Json(entries))
}
