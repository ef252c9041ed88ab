//! Snowflake SQL API client
//!
//! Statements go through `POST /api/v2/statements`. Each submission carries a
//! fresh `requestId`; long statements come back `202 Accepted` with a handle
//! that is polled until the statement finishes.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::Warehouse;
use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// Snowflake Configuration Constants
// ============================================================================

/// Default token type sent in `X-Snowflake-Authorization-Token-Type`.
pub const DEFAULT_TOKEN_TYPE: &str = "OAUTH";

/// Default stage holding the output files.
pub const DEFAULT_STAGE: &str = "@substreams_stage";

/// Default named parquet file format.
pub const DEFAULT_FILE_FORMAT: &str = "substreams_parquet";

/// Default server-side statement timeout in seconds.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 3600;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    /// e.g. `https://<account>.snowflakecomputing.com`
    pub account_url: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub token_type: String,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub stage: String,
    pub file_format: String,
    pub statement_timeout_secs: u64,
}

impl SnowflakeConfig {
    pub fn from_env() -> Self {
        Self {
            account_url: env::var("SNOWFLAKE_ACCOUNT_URL").unwrap_or_default(),
            token: env::var("SNOWFLAKE_TOKEN").unwrap_or_default(),
            token_type: env::var("SNOWFLAKE_TOKEN_TYPE")
                .unwrap_or_else(|_| DEFAULT_TOKEN_TYPE.to_string()),
            database: env::var("SNOWFLAKE_DATABASE").ok(),
            schema: env::var("SNOWFLAKE_SCHEMA").ok(),
            warehouse: env::var("SNOWFLAKE_WAREHOUSE").ok(),
            role: env::var("SNOWFLAKE_ROLE").ok(),
            stage: env::var("SNOWFLAKE_STAGE").unwrap_or_else(|_| DEFAULT_STAGE.to_string()),
            file_format: env::var("SNOWFLAKE_FILE_FORMAT")
                .unwrap_or_else(|_| DEFAULT_FILE_FORMAT.to_string()),
            statement_timeout_secs: env::var("SNOWFLAKE_STATEMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STATEMENT_TIMEOUT_SECS),
        }
    }

    /// Only needed by commands that load data.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.account_url.is_empty() {
            anyhow::bail!("SNOWFLAKE_ACCOUNT_URL must be set");
        }
        if self.token.is_empty() {
            anyhow::bail!("SNOWFLAKE_TOKEN must be set");
        }
        if self.statement_timeout_secs == 0 {
            anyhow::bail!("SNOWFLAKE_STATEMENT_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
}

impl StatementResponse {
    fn describe(&self) -> String {
        format!(
            "{} ({}): {}",
            self.code.as_deref().unwrap_or("unknown"),
            self.sql_state.as_deref().unwrap_or("-"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}

pub struct SnowflakeClient {
    client: Client,
    config: SnowflakeConfig,
    poll_interval: Duration,
}

impl SnowflakeClient {
    pub fn new(client: Client, config: SnowflakeConfig) -> Self {
        Self {
            client,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.account_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.config.token)
            .header("X-Snowflake-Authorization-Token-Type", &self.config.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Decode a response; `Ok(None)` once the statement has finished.
    async fn read_status(response: Response) -> PipelineResult<Option<String>> {
        let status = response.status();
        let body: StatementResponse = response.json().await.map_err(|e| {
            PipelineError::Warehouse(format!("unreadable response ({}): {}", status, e))
        })?;

        match status {
            StatusCode::OK => Ok(None),
            StatusCode::ACCEPTED => body.statement_handle.map(Some).ok_or_else(|| {
                PipelineError::Warehouse("statement accepted without a handle".into())
            }),
            _ => Err(PipelineError::Warehouse(body.describe())),
        }
    }
}

#[async_trait]
impl Warehouse for SnowflakeClient {
    #[instrument(skip(self, statement))]
    async fn execute(&self, statement: &str) -> PipelineResult<()> {
        let request_id = Uuid::new_v4();
        let body = json!({
            "statement": statement,
            "timeout": self.config.statement_timeout_secs,
            "database": self.config.database,
            "schema": self.config.schema,
            "warehouse": self.config.warehouse,
            "role": self.config.role,
        });

        debug!(%request_id, "Submitting statement");

        let response = self
            .authorized(self.client.post(self.url("/api/v2/statements")))
            .query(&[("requestId", request_id.to_string())])
            .json(&body)
            .send()
            .await?;

        let Some(handle) = Self::read_status(response).await? else {
            return Ok(());
        };

        // Allow the server-side timeout to fire before giving up locally.
        let deadline =
            Instant::now() + Duration::from_secs(self.config.statement_timeout_secs + 60);
        let status_url = self.url(&format!("/api/v2/statements/{}", handle));

        loop {
            if Instant::now() >= deadline {
                warn!(%handle, "Gave up polling statement");
                return Err(PipelineError::Warehouse(format!(
                    "statement {} did not finish within {}s",
                    handle, self.config.statement_timeout_secs
                )));
            }

            tokio::time::sleep(self.poll_interval).await;

            let response = self.authorized(self.client.get(&status_url)).send().await?;
            if Self::read_status(response).await?.is_none() {
                debug!(%handle, "Statement finished");
                return Ok(());
            }
        }
    }
}
