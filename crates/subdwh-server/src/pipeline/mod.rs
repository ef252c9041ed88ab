//! Pipeline components
//!
//! Two pipelines share the state store:
//!
//! - **discovery → processing**: [`PackageDiscoveryScheduler`] emits one
//!   [`RunRequest`] per package; [`ProcessingJob`] turns a package into output
//!   files and reports through notification hooks.
//! - **upload → load**: [`UploadScheduler`] finds output files since the cursor
//!   that still await upload; [`LoadJob`] loads them per table and marks them
//!   uploaded.
//!
//! Schedulers never run jobs themselves. They return a [`TickOutcome`] and the
//! runtime decides whether and when each request executes.

use serde::Serialize;
use std::collections::BTreeMap;

pub mod discovery;
pub mod load;
pub mod processing;
pub mod upload;

pub use discovery::PackageDiscoveryScheduler;
pub use load::{LoadBatch, LoadJob, LoadReport};
pub use processing::{ProcessingJob, ProcessingOutcome};
pub use upload::UploadScheduler;

/// Run key under which every LoadJob is dispatched.
pub const LOAD_JOB_RUN_KEY: &str = "load-job";

/// Tag carrying the package a processing run belongs to.
pub const ONE_JOB_TAG: &str = "one_job";

/// Work a run performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobSpec {
    Process { package_key: String },
    Load { file_keys: Vec<String> },
}

/// A request for the runtime to execute one job
///
/// `run_key` is the dedup token: the runtime never runs two requests with the
/// same key at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRequest {
    pub run_key: String,
    pub tags: BTreeMap<String, String>,
    #[serde(flatten)]
    pub job: JobSpec,
}

impl RunRequest {
    /// Processing run for one package, keyed by the package itself.
    pub fn process(package_key: impl Into<String>) -> Self {
        let package_key = package_key.into();
        Self {
            run_key: package_key.clone(),
            tags: BTreeMap::from([(ONE_JOB_TAG.to_string(), package_key.clone())]),
            job: JobSpec::Process { package_key },
        }
    }

    pub fn load(file_keys: Vec<String>) -> Self {
        Self {
            run_key: LOAD_JOB_RUN_KEY.to_string(),
            tags: BTreeMap::new(),
            job: JobSpec::Load { file_keys },
        }
    }

    pub fn dedup_key(&self) -> &str {
        &self.run_key
    }
}

/// Result of one scheduler invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Dispatched { requests: Vec<RunRequest> },
    /// Nothing to do; not an error.
    Skipped { reason: String },
}

impl TickOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        TickOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn requests(&self) -> &[RunRequest] {
        match self {
            TickOutcome::Dispatched { requests } => requests,
            TickOutcome::Skipped { .. } => &[],
        }
    }

    pub fn into_requests(self) -> Vec<RunRequest> {
        match self {
            TickOutcome::Dispatched { requests } => requests,
            TickOutcome::Skipped { .. } => Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped { .. })
    }
}
