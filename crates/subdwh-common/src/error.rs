//! Error types shared by subdwh crates

use thiserror::Error;

/// Result type alias for shared-type operations
pub type Result<T> = std::result::Result<T, SubdwhError>;

/// Errors raised while parsing or validating shared domain types
#[derive(Error, Debug)]
pub enum SubdwhError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing field `{0}` in block-range-info response")]
    MissingField(&'static str),

    #[error("Invalid block number for `{field}`: {value}")]
    InvalidBlockNumber { field: &'static str, value: String },

    #[error("Invalid block range: stop_block {stop} is before start_block {start}")]
    InvertedRange { start: u64, stop: u64 },

    #[error("Unknown upload state: {0}")]
    UnknownUploadState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
