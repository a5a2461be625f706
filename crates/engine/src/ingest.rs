//! The ingest path loopback nodes write back into.

use async_trait::async_trait;

use strom_core::Point;

use crate::error::EngineError;

/// Accepts points for re-ingestion. Implemented by the task manager
/// that owns the running tasks; the engine only consumes the interface.
#[async_trait]
pub trait Ingest: Send + Sync {
    async fn write_point(&self, point: Point) -> Result<(), EngineError>;
}
