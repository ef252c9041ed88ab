//! Configuration management

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::notify::slack::DEFAULT_SLACK_API_URL;
use crate::runtime::{CronTrigger, DEFAULT_SCHEDULE};
use crate::storage::config::StorageConfig;
use crate::warehouse::SnowflakeConfig;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default deployment environment.
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// Default prefix packages are listed under.
pub const DEFAULT_PACKAGE_PREFIX: &str = "spkgs/";

/// Default package file extension.
pub const DEFAULT_PACKAGE_EXTENSION: &str = ".spkg";

/// Default prefix produced output files are written under.
pub const DEFAULT_OUTPUT_PREFIX: &str = "substreams";

/// Default local directory packages are downloaded to.
pub const DEFAULT_WORK_DIR: &str = "/tmp/subdwh";

/// Default key of the upload cursor object.
pub const DEFAULT_CURSOR_KEY: &str = "checkpoints/upload_cursor";

/// Default prefix of the processing status ledger.
pub const DEFAULT_LEDGER_PREFIX: &str = "status/";

/// Default local path of the package binary.
pub const DEFAULT_BINARY_PATH: &str = "/tmp/messari_cli";

/// Default key of the package binary in the package bucket.
pub const DEFAULT_BINARY_KEY: &str = "cli/messari_cli";

/// Default processing timeout in seconds (one day).
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 86_400;

/// Default substreams token endpoint.
pub const DEFAULT_AUTH_URI: &str = "https://auth.streamingfast.io/v1/auth/issue";

/// Default notification channel.
pub const DEFAULT_SLACK_CHANNEL: &str = "substreams_dwh_notifications";

/// Default number of runs executing at once.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

/// Default HTTP timeout for Slack, auth and Snowflake calls in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const ENVIRONMENTS: &[&str] = &["dev", "stage", "prod"];

/// Where retry classification reads the latest status message from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Ledger,
    Slack,
}

impl FromStr for ClassificationSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "ledger" => Ok(Self::Ledger),
            "slack" => Ok(Self::Slack),
            other => anyhow::bail!("CLASSIFICATION_SOURCE must be 'ledger' or 'slack', got '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub binary: BinaryConfig,
    pub slack: SlackConfig,
    pub warehouse: SnowflakeConfig,
    pub schedule: ScheduleConfig,
    pub classification: ClassificationSource,
    pub table_mapping_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub package_prefix: String,
    pub package_extension: String,
    pub output_prefix: String,
    pub work_dir: PathBuf,
    pub cursor_key: String,
    pub ledger_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryConfig {
    pub path: PathBuf,
    pub key: String,
    pub process_timeout_secs: u64,
    pub auth_uri: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(skip_serializing)]
    pub bot_token: String,
    pub channel: String,
    pub api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub discovery: String,
    pub upload: String,
    pub max_concurrent_runs: usize,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without validating.
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = env_or("ENVIRONMENT", DEFAULT_ENVIRONMENT);

        Ok(Config {
            storage: StorageConfig::from_env(&environment)?,
            environment,
            pipeline: PipelineConfig {
                package_prefix: env_or("PACKAGE_PREFIX", DEFAULT_PACKAGE_PREFIX),
                package_extension: env_or("PACKAGE_EXTENSION", DEFAULT_PACKAGE_EXTENSION),
                output_prefix: env_or("OUTPUT_PREFIX", DEFAULT_OUTPUT_PREFIX),
                work_dir: PathBuf::from(env_or("WORK_DIR", DEFAULT_WORK_DIR)),
                cursor_key: env_or("CURSOR_KEY", DEFAULT_CURSOR_KEY),
                ledger_prefix: env_or("LEDGER_PREFIX", DEFAULT_LEDGER_PREFIX),
            },
            binary: BinaryConfig {
                path: PathBuf::from(env_or("MESSARI_CLI_PATH", DEFAULT_BINARY_PATH)),
                key: env_or("MESSARI_CLI_KEY", DEFAULT_BINARY_KEY),
                process_timeout_secs: env_parse(
                    "PROCESS_TIMEOUT_SECS",
                    DEFAULT_PROCESS_TIMEOUT_SECS,
                ),
                auth_uri: env_or("SUBSTREAMS_AUTH_URI", DEFAULT_AUTH_URI),
                api_key: env::var("SUBSTREAMS_API_KEY").ok().filter(|k| !k.is_empty()),
            },
            slack: SlackConfig {
                bot_token: env::var("SLACK_BOT_TOKEN").unwrap_or_default(),
                channel: env_or("SLACK_CHANNEL", DEFAULT_SLACK_CHANNEL),
                api_url: env_or("SLACK_API_URL", DEFAULT_SLACK_API_URL),
            },
            warehouse: SnowflakeConfig::from_env(),
            schedule: ScheduleConfig {
                discovery: env_or("DISCOVERY_SCHEDULE", DEFAULT_SCHEDULE),
                upload: env_or("UPLOAD_SCHEDULE", DEFAULT_SCHEDULE),
                max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", DEFAULT_MAX_CONCURRENT_RUNS),
            },
            classification: env_or("CLASSIFICATION_SOURCE", "ledger").parse()?,
            table_mapping_file: env::var("TABLE_MAPPING_FILE").ok().map(PathBuf::from),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            anyhow::bail!(
                "ENVIRONMENT must be one of {:?}, got '{}'",
                ENVIRONMENTS,
                self.environment
            );
        }

        self.storage.validate()?;

        if self.pipeline.package_extension.is_empty() {
            anyhow::bail!("PACKAGE_EXTENSION cannot be empty");
        }
        if self.pipeline.output_prefix.is_empty() {
            anyhow::bail!("OUTPUT_PREFIX cannot be empty");
        }
        if self.pipeline.cursor_key.starts_with(&self.pipeline.output_prefix) {
            anyhow::bail!(
                "CURSOR_KEY ({}) must not live under OUTPUT_PREFIX ({})",
                self.pipeline.cursor_key,
                self.pipeline.output_prefix
            );
        }
        if self.pipeline.ledger_prefix.starts_with(&self.pipeline.output_prefix) {
            anyhow::bail!(
                "LEDGER_PREFIX ({}) must not live under OUTPUT_PREFIX ({})",
                self.pipeline.ledger_prefix,
                self.pipeline.output_prefix
            );
        }

        if self.binary.process_timeout_secs == 0 {
            anyhow::bail!("PROCESS_TIMEOUT_SECS must be greater than 0");
        }

        if self.schedule.max_concurrent_runs == 0 {
            anyhow::bail!("MAX_CONCURRENT_RUNS must be greater than 0");
        }
        CronTrigger::parse("discovery", &self.schedule.discovery)?;
        CronTrigger::parse("upload", &self.schedule.upload)?;

        if self.slack.bot_token.is_empty() {
            tracing::warn!("SLACK_BOT_TOKEN is not set - notifications will fail");
        }

        Ok(())
    }

    pub fn output_prefix_dir(&self) -> String {
        format!("{}/", self.pipeline.output_prefix.trim_end_matches('/'))
    }
}
