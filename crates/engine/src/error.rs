use strom_core::CoreError;
use strom_edge::EdgeError;
use strom_udf::UdfError;
use thiserror::Error;

/// Errors from node execution and task lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("edge error: {0}")]
    Edge(#[from] EdgeError),

    #[error("udf error: {0}")]
    Udf(#[from] UdfError),

    #[error("node {node}: {message}")]
    Node { node: String, message: String },

    #[error("task aborted")]
    Aborted,

    #[error("node panicked: {0}")]
    Panic(String),

    #[error("too many combinations: more than {max}")]
    TooManyCombinations { max: u64 },
}

impl EngineError {
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Node {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Node logic failing inside a receiver callback surfaces through the
/// consumer as a receiver error.
impl From<EngineError> for EdgeError {
    fn from(e: EngineError) -> Self {
        EdgeError::Node(e.to_string())
    }
}
