pub mod alert;
pub mod combin;
pub mod error;
pub mod ingest;
mod node;
mod nodes;
pub mod task;
pub mod timer;
pub mod waiter;

pub use alert::{AlertData, AlertEvent, AlertHandler, AlertLevel, LogHandler};
pub use combin::Combinator;
pub use error::EngineError;
pub use ingest::Ingest;
pub use task::{ExecutingTask, SnapshotProvider, TaskCollector, TaskContext, TaskStats};
pub use timer::Timer;
pub use waiter::{Waiter, WaiterGroup};
