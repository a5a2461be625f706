//! HTTP router construction.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::api;
use crate::auth::require_privilege;
use crate::state::AppState;

/// Assemble all routes plus the auth middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(api::ping))
        .route("/write", post(api::write))
        .route("/tasks", get(api::tasks_list))
        // Static segment registered ahead of the {id} capture.
        .route("/tasks/changes", get(api::tasks_watch))
        .route("/tasks/{id}", get(api::tasks_get))
        .route("/tasks/{id}/enable", post(api::tasks_enable))
        .route("/tasks/{id}/disable", post(api::tasks_disable))
        .route("/tasks/{id}/stats", get(api::tasks_stats))
        .route("/config", get(api::config_get))
        .route("/config/{section}", post(api::config_override))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_privilege,
        ))
        .with_state(state)
}
