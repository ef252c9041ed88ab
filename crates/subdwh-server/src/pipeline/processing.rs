//! Package processing job
//!
//! One run per package: download it, ask the binary for the block extent,
//! decide which notifications the run deserves, then process.
//!
//! Classification against the latest status message for the package:
//!
//! | latest message                  | started notice      | hooks              |
//! |---------------------------------|---------------------|--------------------|
//! | error younger than 30 minutes   | never               | success            |
//! | anything else, or none          | if range > 10,000   | success + failure  |
//!
//! A retry of a recent failure stays quiet until it succeeds, so a flapping
//! package does not flood the channel.

use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subdwh_common::types::RECENT_FAILURE_WINDOW_SECS;
use subdwh_common::BlockRange;
use tracing::{debug, info, instrument, warn};

use crate::binary::{PackageBinary, TokenIssuer};
use crate::error::{PipelineError, PipelineResult};
use crate::notify::{HookSet, Notifier, RunHistory};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// `stop_block == start_block`; nothing was run or sent.
    NothingToProcess { range: BlockRange },
    Processed { range: BlockRange, hooks: HookSet },
}

pub struct ProcessingJob {
    packages: Arc<dyn ObjectStore>,
    binary: Arc<dyn PackageBinary>,
    auth: Arc<dyn TokenIssuer>,
    history: Arc<dyn RunHistory>,
    notifier: Notifier,
    work_dir: PathBuf,
}

impl ProcessingJob {
    pub fn new(
        packages: Arc<dyn ObjectStore>,
        binary: Arc<dyn PackageBinary>,
        auth: Arc<dyn TokenIssuer>,
        history: Arc<dyn RunHistory>,
        notifier: Notifier,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            packages,
            binary,
            auth,
            history,
            notifier,
            work_dir: work_dir.into(),
        }
    }

    fn local_path(&self, package_key: &str) -> PathBuf {
        self.work_dir.join(package_key.trim_start_matches('/'))
    }

    #[instrument(skip(self), fields(package = %package_key))]
    pub async fn run(&self, package_key: &str) -> PipelineResult<ProcessingOutcome> {
        let local = self.local_path(package_key);
        self.packages
            .download_to(package_key, &local)
            .await
            .map_err(PipelineError::storage)?;

        let outcome = self.run_downloaded(package_key, &local).await;

        if let Err(e) = tokio::fs::remove_file(&local).await {
            debug!(path = %local.display(), error = %e, "Could not remove downloaded package");
        }

        outcome
    }

    async fn run_downloaded(
        &self,
        package_key: &str,
        local: &Path,
    ) -> PipelineResult<ProcessingOutcome> {
        let response = self.binary.block_range_info(local).await?;
        let range = BlockRange::from_response(&response).map_err(|e| {
            PipelineError::Configuration(format!("{}: block-range-info: {}", package_key, e))
        })?;

        if range.is_empty() {
            info!(%range, "Package is up to date; nothing to process");
            return Ok(ProcessingOutcome::NothingToProcess { range });
        }

        let hooks = self.classify(package_key, &range).await;

        let result = self.process(local).await;
        hooks.fire(&self.notifier, package_key, result.is_ok()).await;

        match result {
            Ok(()) => {
                info!(%range, "Package processed");
                Ok(ProcessingOutcome::Processed { range, hooks })
            },
            Err(e) => {
                warn!(%range, error = %e, "Package processing failed");
                Err(e)
            },
        }
    }

    async fn process(&self, local: &Path) -> PipelineResult<()> {
        let token = self.auth.issue_token().await?;
        self.binary.process(local, &token).await
    }

    /// Pick hooks for this run and send the started notice when due.
    async fn classify(&self, package_key: &str, range: &BlockRange) -> HookSet {
        let extended = range.is_extended();

        // History is advisory; an unreachable source classifies as a fresh run.
        let latest = match self.history.latest_for(package_key).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "Could not read run history");
                None
            },
        };

        let window = Duration::seconds(RECENT_FAILURE_WINDOW_SECS);
        if latest.is_some_and(|record| record.is_recent_failure(Utc::now(), window)) {
            info!(%range, "Retrying a recent failure; only success will be reported");
            return HookSet::new().on_success(success_message(package_key, range, extended));
        }

        if extended {
            self.notifier
                .send_best_effort(Some(package_key), &started_message(package_key, range))
                .await;
        }

        HookSet::new()
            .on_success(success_message(package_key, range, extended))
            .on_failure(failure_message(package_key, range, extended))
    }
}

fn extent_label(extended: bool) -> &'static str {
    if extended {
        "extended processing"
    } else {
        "processing"
    }
}

pub fn started_message(package_key: &str, range: &BlockRange) -> String {
    format!(
        "{}: Started extended processing from block: {} to head of chain: {}",
        package_key, range.start_block, range.stop_block
    )
}

pub fn success_message(package_key: &str, range: &BlockRange, extended: bool) -> String {
    format!(
        "{}: Successfully finished {} from block: {} to head of chain: {}",
        package_key,
        extent_label(extended),
        range.start_block,
        range.stop_block
    )
}

pub fn failure_message(package_key: &str, range: &BlockRange, extended: bool) -> String {
    format!(
        "{}: An error occurred when {} from block: {} to head of chain: {}",
        package_key,
        extent_label(extended),
        range.start_block,
        range.stop_block
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RunHook;
    use crate::test_helpers::{FakeBinary, FakeTokenIssuer, FixedHistory, MemoryStore, RecordingChat};
    use tempfile::TempDir;

    const PKG: &str = "spkgs/uniswap.spkg";

    struct Fixture {
        chat: Arc<RecordingChat>,
        binary: Arc<FakeBinary>,
        auth: Arc<FakeTokenIssuer>,
        job: ProcessingJob,
        _work_dir: TempDir,
    }

    fn fixture(binary: FakeBinary, auth: FakeTokenIssuer, history: FixedHistory) -> Fixture {
        let store = Arc::new(MemoryStore::new("packages"));
        store.insert_object(PKG, "package bytes");

        let chat = Arc::new(RecordingChat::new());
        let binary = Arc::new(binary);
        let auth = Arc::new(auth);
        let work_dir = TempDir::new().unwrap();

        let job = ProcessingJob::new(
            store,
            binary.clone(),
            auth.clone(),
            Arc::new(history),
            Notifier::new(chat.clone(), "alerts"),
            work_dir.path(),
        );

        Fixture {
            chat,
            binary,
            auth,
            job,
            _work_dir: work_dir,
        }
    }

    #[tokio::test]
    async fn test_empty_range_has_no_side_effects() {
        let f = fixture(
            FakeBinary::new(r#"{"start_block": 100, "stop_block": 100}"#),
            FakeTokenIssuer::ok("t"),
            FixedHistory::empty(),
        );

        let outcome = f.job.run(PKG).await.unwrap();

        assert!(matches!(outcome, ProcessingOutcome::NothingToProcess { .. }));
        assert_eq!(f.binary.process_calls(), 0);
        assert_eq!(f.auth.calls(), 0);
        assert!(f.chat.posted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_start_block_is_configuration_error() {
        let f = fixture(
            FakeBinary::new(r#"{"stop_block": 200}"#),
            FakeTokenIssuer::ok("t"),
            FixedHistory::empty(),
        );

        let err = f.job.run(PKG).await.unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(!err.is_retryable());
        assert_eq!(f.binary.process_calls(), 0);
        assert!(f.chat.posted().is_empty());
    }

    #[tokio::test]
    async fn test_extended_run_announces_start_and_success() {
        let f = fixture(
            FakeBinary::with_range(0, 20_000),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::empty(),
        );

        let outcome = f.job.run(PKG).await.unwrap();

        let texts = f.chat.texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(
            texts[0],
            "spkgs/uniswap.spkg: Started extended processing from block: 0 to head of chain: 20000"
        );
        assert!(texts[1].contains("Successfully finished extended processing"));
        assert_eq!(f.binary.last_token().as_deref(), Some("tok"));

        let ProcessingOutcome::Processed { hooks, .. } = outcome else {
            panic!("expected a processed outcome");
        };
        assert!(hooks.has_failure_hook());
    }

    #[tokio::test]
    async fn test_small_run_attaches_both_hooks_without_start_notice() {
        let f = fixture(
            FakeBinary::with_range(100, 10_100),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::empty(),
        );

        let outcome = f.job.run(PKG).await.unwrap();

        let texts = f.chat.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Successfully finished processing"));
        assert!(!texts[0].contains("extended processing"));

        let ProcessingOutcome::Processed { hooks, .. } = outcome else {
            panic!("expected a processed outcome");
        };
        assert_eq!(hooks.hooks().len(), 2);
    }

    #[tokio::test]
    async fn test_recent_failure_gets_success_hook_only() {
        let f = fixture(
            FakeBinary::with_range(0, 50_000).failing_process("boom"),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::with(
                "spkgs/uniswap.spkg: An error occurred when extended processing",
                Utc::now() - Duration::minutes(10),
            ),
        );

        let err = f.job.run(PKG).await.unwrap_err();

        assert!(matches!(err, PipelineError::ExternalCommand { .. }));
        assert!(f.chat.posted().is_empty());
    }

    #[tokio::test]
    async fn test_recent_failure_reports_success_with_extended_wording() {
        let f = fixture(
            FakeBinary::with_range(0, 50_000),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::with("spkgs/uniswap.spkg: An error occurred", Utc::now() - Duration::minutes(5)),
        );

        let outcome = f.job.run(PKG).await.unwrap();

        let texts = f.chat.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Successfully finished extended processing"));

        let ProcessingOutcome::Processed { hooks, .. } = outcome else {
            panic!("expected a processed outcome");
        };
        assert!(matches!(hooks.hooks(), [RunHook::OnSuccess(_)]));
    }

    #[tokio::test]
    async fn test_stale_failure_is_treated_as_fresh_run() {
        let f = fixture(
            FakeBinary::with_range(0, 50_000),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::with("spkgs/uniswap.spkg: An error occurred", Utc::now() - Duration::minutes(45)),
        );

        f.job.run(PKG).await.unwrap();

        let texts = f.chat.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("Started extended processing"));
    }

    #[tokio::test]
    async fn test_process_failure_fires_failure_hook_and_returns_error() {
        let f = fixture(
            FakeBinary::with_range(0, 500).failing_process("segfault"),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::empty(),
        );

        let err = f.job.run(PKG).await.unwrap_err();

        assert!(matches!(err, PipelineError::ExternalCommand { .. }));
        assert_eq!(
            f.chat.texts(),
            vec!["spkgs/uniswap.spkg: An error occurred when processing from block: 0 to head of chain: 500"]
        );
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_before_processing() {
        let f = fixture(
            FakeBinary::with_range(0, 500),
            FakeTokenIssuer::failing(),
            FixedHistory::empty(),
        );

        let err = f.job.run(PKG).await.unwrap_err();

        assert!(matches!(err, PipelineError::Authentication(_)));
        assert_eq!(f.binary.process_calls(), 0);
        assert!(f.chat.texts()[0].contains("An error occurred"));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_mask_success() {
        let f = fixture(
            FakeBinary::with_range(0, 20_000),
            FakeTokenIssuer::ok("tok"),
            FixedHistory::empty(),
        );
        f.chat.fail_posts(true);

        assert!(f.job.run(PKG).await.is_ok());
        assert_eq!(f.binary.process_calls(), 1);
    }

    #[test]
    fn test_message_wording_follows_threshold() {
        let range = BlockRange::new(10, 20).unwrap();
        assert!(!success_message("p", &range, false).contains("extended"));
        assert!(failure_message("p", &range, true).contains("extended processing"));
    }
}
