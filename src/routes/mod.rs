//! Route modules for the memory sync service

pub mod audit;
pub mod devices;
pub mod health;
pub mod memory;
pub mod sync;

use axum::Router;

use crate::state::AppState;

/// All `/api/v1` routes
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/health", health::router())
        .nest("/memory", memory::router())
        .nest("/sync", sync::router())
        .nest("/devices", devices::router())
        .nest("/audit", audit::router())
}

/// Full application router, without middleware
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1", api_router())
        .with_state(state)
}
