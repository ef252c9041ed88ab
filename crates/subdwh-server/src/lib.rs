//! Substreams Data Warehouse Library
//!
//! Processes substreams packages and loads their output into Snowflake.
//!
//! # Overview
//!
//! Two scheduled pipelines share state kept in object storage:
//!
//! - **Processing**: packages under a fixed prefix are discovered every tick
//!   and each one gets its own processing run. Runs report to a Slack channel
//!   and classify retries from the latest status message for the package.
//! - **Loading**: output files written since the upload cursor are grouped by
//!   destination table and bulk-loaded, then marked uploaded in their object
//!   metadata.
//!
//! # Architecture
//!
//! Every external system sits behind a narrow trait so the pipelines can be
//! driven by the in-process runtime and by tests alike:
//!
//! | Trait                          | Production implementation         |
//! |--------------------------------|-----------------------------------|
//! | [`storage::ObjectStore`]       | [`storage::Storage`] (S3)         |
//! | [`state::StateStore`]          | [`state::ObjectStateStore`]       |
//! | [`binary::PackageBinary`]      | [`binary::MessariCli`]            |
//! | [`binary::TokenIssuer`]        | [`binary::SubstreamsAuth`]        |
//! | [`notify::ChatClient`]         | [`notify::SlackClient`]           |
//! | [`notify::RunHistory`]         | [`ledger::StatusLedger`], [`notify::NotificationHistory`] |
//! | [`warehouse::Warehouse`]       | [`warehouse::SnowflakeClient`]    |
//! | [`tables::TableMapper`]        | [`tables::RuleTableMapper`]       |
//!
//! # Example
//!
//! ```no_run
//! use subdwh_server::{app::App, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::build(Config::load()?).await?;
//!     let outcome = app.upload.tick().await?;
//!     println!("{}", serde_json::to_string_pretty(&outcome)?);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod binary;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod tables;
pub mod test_helpers;
pub mod warehouse;

// Re-export commonly used types
pub use error::{PipelineError, PipelineResult};
