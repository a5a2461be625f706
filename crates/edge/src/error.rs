use strom_core::MessageKind;
use thiserror::Error;

/// Errors from edges and the consumers that drive them.
#[derive(Debug, Error)]
pub enum EdgeError {
    /// The edge was aborted; pending and future operations fail fast.
    #[error("edge aborted")]
    Aborted,

    /// Collect was attempted on a closed edge.
    #[error("edge closed")]
    Closed,

    /// A message arrived that the protocol does not allow here, e.g. a
    /// batch point outside begin/end framing.
    #[error("unexpected {kind} message: {context}")]
    UnexpectedMessage {
        kind: MessageKind,
        context: &'static str,
    },

    /// A receiver's own logic failed; consumption stops and the error
    /// propagates to the node driving it.
    #[error("{0}")]
    Node(String),
}

impl EdgeError {
    pub fn unexpected(kind: MessageKind, context: &'static str) -> Self {
        EdgeError::UnexpectedMessage { kind, context }
    }
}
