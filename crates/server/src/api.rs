//! Route handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use strom_core::Override;

use crate::error::ServerError;
use crate::state::{AppState, TaskSummary};

pub async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `POST /write?db=...&rp=...` — ingest a write body.
pub async fn write(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let db = params
        .get("db")
        .ok_or_else(|| ServerError::BadRequest("missing db parameter".into()))?;
    let rp = params.get("rp").map(String::as_str).unwrap_or("autogen");
    state.write.write(db, rp, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn tasks_list(State(state): State<Arc<AppState>>) -> Json<Vec<TaskSummary>> {
    Json(state.tasks.list().await)
}

pub async fn tasks_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskSummary>, ServerError> {
    Ok(Json(state.tasks.get(&id).await?))
}

pub async fn tasks_enable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.tasks.enable(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn tasks_disable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.tasks.disable(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /tasks/changes` — long-poll until the task set changes or the
/// poll window elapses.
pub async fn tasks_watch(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut waiter = state.tasks.change_waiter().await;
    let changed = tokio::time::timeout(std::time::Duration::from_secs(30), waiter.wait())
        .await
        .unwrap_or(false);
    Json(serde_json::json!({ "changed": changed }))
}

pub async fn tasks_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    Ok(Json(state.tasks.stats(&id).await?))
}

pub async fn config_get(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.config.snapshot();
    Json(serde_json::to_value(&*snapshot).unwrap_or_default())
}

/// `POST /config/{section}` — apply a typed override to one section.
pub async fn config_override(
    State(state): State<Arc<AppState>>,
    Path(section): Path<String>,
    Json(mut ov): Json<Override>,
) -> Result<StatusCode, ServerError> {
    ov.section = section;
    state.config.apply(&ov)?;
    Ok(StatusCode::NO_CONTENT)
}
