//! Pipeline error types
//!
//! Mirrors the failure taxonomy operators see in the notification channel:
//! configuration problems are fatal, command and load failures surface through
//! failure hooks, and storage errors keep their `anyhow` context chain.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad deployment or binary contract; retrying cannot help.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command `{command}` exited with {status}: {stderr}")]
    ExternalCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout_secs}s")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Load failed for {} table(s): {}", failed.len(), describe_failures(failed))]
    PartialLoad {
        loaded_tables: Vec<String>,
        failed: Vec<(String, String)>,
    },

    #[error("Upload state transition failed for {} file(s): {}", files.len(), files.join(", "))]
    Transition { files: Vec<String> },

    #[error("Refusing to move {key} from {from} back to {to}")]
    InvalidTransition {
        key: String,
        from: subdwh_common::UploadState,
        to: subdwh_common::UploadState,
    },

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] subdwh_common::SubdwhError),
}

impl PipelineError {
    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(err)
    }

    /// Whether a later invocation can be expected to succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::Authentication(_)
                | PipelineError::InvalidTransition { .. }
                | PipelineError::Common(_)
        )
    }
}

fn describe_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(table, error)| format!("{} ({})", table, error))
        .collect::<Vec<_>>()
        .join(", ")
}
