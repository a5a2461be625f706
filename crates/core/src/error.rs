use thiserror::Error;

/// Errors from the core data model, task definitions, and configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid time: {0}")]
    Time(String),

    #[error("invalid field: {0}")]
    Field(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid task definition: {0}")]
    Definition(String),

    #[error("unknown config section: {0}")]
    UnknownSection(String),

    #[error("unknown element {element} in config section {section}")]
    UnknownElement { section: String, element: String },

    #[error("unknown option {option} in config section {section}")]
    UnknownOption { section: String, option: String },

    #[error("option {option} expects a {expected} value, got {got}")]
    OptionType {
        option: String,
        expected: &'static str,
        got: &'static str,
    },
}
