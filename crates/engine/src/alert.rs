//! Alert events and handler dispatch.
//!
//! The engine evaluates trigger conditions and produces [`AlertEvent`]s;
//! delivery channels live outside the core behind the [`AlertHandler`]
//! trait. Individual handler failures are logged and do not block the
//! other handlers or fail the node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strom_core::{BufferedBatch, GroupInfo, Point};

use crate::error::EngineError;

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Ok,
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Ok => "OK",
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// The record(s) that triggered an alert.
#[derive(Debug, Clone)]
pub enum AlertData {
    Point(Point),
    Batch(BufferedBatch),
}

/// One alert occurrence, handed to every configured handler.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub id: String,
    pub message: String,
    pub task: String,
    pub node: String,
    pub group: GroupInfo,
    pub time: DateTime<Utc>,
    pub level: AlertLevel,
    pub prev_level: AlertLevel,
    pub data: AlertData,
}

/// A delivery channel for alert events.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, event: &AlertEvent) -> Result<(), EngineError>;

    /// Human-readable channel name for logs.
    fn name(&self) -> &str;
}

/// Handler that writes alerts to the log. Useful as a default channel
/// and in tests.
pub struct LogHandler;

#[async_trait]
impl AlertHandler for LogHandler {
    async fn handle(&self, event: &AlertEvent) -> Result<(), EngineError> {
        tracing::info!(
            alert = %event.id,
            level = %event.level,
            prev = %event.prev_level,
            group = %event.group.id,
            "{}",
            event.message
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Deliver one event to every handler; failures are logged, not raised.
pub async fn dispatch(handlers: &[Arc<dyn AlertHandler>], event: &AlertEvent) {
    for handler in handlers {
        if let Err(e) = handler.handle(event).await {
            tracing::warn!(
                handler = handler.name(),
                alert = %event.id,
                error = %e,
                "alert delivery failed"
            );
        }
    }
}

/// Expand the `{task}`, `{id}`, `{level}`, `{name}`, and `{group}`
/// placeholders of an alert template.
pub fn render_template(
    template: &str,
    vars: &HashMap<&'static str, String>,
) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
