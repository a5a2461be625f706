//! Shared application state and the handler interfaces the routes call.
//!
//! The HTTP layer only routes and authenticates; the work happens in
//! injected implementations of [`WriteHandler`] and [`TaskControl`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use strom_core::{ConfigService, Dbrp, EdgeType};

use crate::auth::Authenticator;
use crate::error::ServerError;

/// Accepts a raw write body for (db, rp) and ingests the points.
#[async_trait]
pub trait WriteHandler: Send + Sync {
    async fn write(&self, db: &str, rp: &str, body: &[u8]) -> Result<(), ServerError>;
}

/// One row of the task listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub kind: EdgeType,
    pub dbrps: Vec<Dbrp>,
    pub enabled: bool,
}

/// Task lifecycle operations exposed over the API.
#[async_trait]
pub trait TaskControl: Send + Sync {
    async fn list(&self) -> Vec<TaskSummary>;
    async fn get(&self, id: &str) -> Result<TaskSummary, ServerError>;
    async fn enable(&self, id: &str) -> Result<(), ServerError>;
    async fn disable(&self, id: &str) -> Result<(), ServerError>;
    async fn stats(&self, id: &str) -> Result<serde_json::Value, ServerError>;

    /// Subscribe to task-set changes, for long-poll watchers.
    async fn change_waiter(&self) -> strom_engine::Waiter;
}

pub struct AppState {
    pub write: Arc<dyn WriteHandler>,
    pub tasks: Arc<dyn TaskControl>,
    pub config: Arc<ConfigService>,
    /// Absent means the server is open (no auth).
    pub auth: Option<Arc<dyn Authenticator>>,
}
