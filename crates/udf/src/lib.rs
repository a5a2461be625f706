pub mod convert;
pub mod error;
pub mod frame;
pub mod proto;
pub mod server;
pub mod worker;

pub use error::UdfError;
pub use frame::{write_frame, FrameReader};
pub use server::{Hooks, UdfConfig, UdfServer};
pub use worker::{ProcessWorker, WorkerHandle};
