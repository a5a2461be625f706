pub mod api;
pub mod auth;
pub mod error;
pub mod manager;
pub mod router;
pub mod state;

pub use auth::{Authenticator, Privilege, TokenAuthenticator};
pub use error::ServerError;
pub use manager::TaskManager;
pub use router::build_router;
pub use state::{AppState, TaskControl, TaskSummary, WriteHandler};
