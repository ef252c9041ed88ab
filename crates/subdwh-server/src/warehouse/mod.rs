//! Warehouse loading
//!
//! [`Warehouse`] executes one SQL statement at a time; [`LoadStatements`]
//! renders the two statements a table group needs. Both statements are
//! re-runnable: the table is only created when absent and `COPY INTO` skips
//! files already present in the table's load history.

use async_trait::async_trait;

use crate::error::PipelineResult;

pub mod snowflake;

pub use snowflake::{SnowflakeClient, SnowflakeConfig};

/// Column every destination table is clustered by.
pub const CLUSTER_COLUMN: &str = "block_number";

/// Most file names Snowflake accepts in one `COPY INTO ... FILES = (...)`.
pub const MAX_FILES_PER_COPY: usize = 1000;

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, statement: &str) -> PipelineResult<()>;
}

/// Renders CREATE and COPY statements against a named stage
#[derive(Debug, Clone)]
pub struct LoadStatements {
    stage: String,
    file_format: String,
}

impl LoadStatements {
    pub fn new(stage: impl Into<String>, file_format: impl Into<String>) -> Self {
        let stage = stage.into();
        let stage = if stage.starts_with('@') {
            stage
        } else {
            format!("@{}", stage)
        };
        Self {
            stage: stage.trim_end_matches('/').to_string(),
            file_format: file_format.into(),
        }
    }

    /// Create `table` if absent, with columns inferred from `template_file`.
    pub fn create_table(&self, table: &str, template_file: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table}\n  \
             USING TEMPLATE (\n    \
             SELECT ARRAY_AGG(OBJECT_CONSTRUCT(*))\n    \
             FROM TABLE(INFER_SCHEMA(LOCATION => '{location}', FILE_FORMAT => '{format}'))\n  \
             )\n  \
             CLUSTER BY ({cluster})",
            table = table,
            location = quote(&format!("{}/{}", self.stage, template_file)),
            format = quote(&self.file_format),
            cluster = CLUSTER_COLUMN,
        )
    }

    /// Load `files` in one statement; callers keep it within [`MAX_FILES_PER_COPY`].
    pub fn copy_into(&self, table: &str, files: &[String]) -> String {
        let files = files
            .iter()
            .map(|f| format!("'{}'", quote(f)))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "COPY INTO {table}\n  \
             FROM {stage}\n  \
             FILES = ({files})\n  \
             FILE_FORMAT = (FORMAT_NAME = '{format}')\n  \
             MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE",
            table = table,
            stage = self.stage,
            files = files,
            format = quote(&self.file_format),
        )
    }
}

/// Escape a value for use inside a single-quoted SQL literal.
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}
