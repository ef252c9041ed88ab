//! Notifications
//!
//! - **slack**: [`ChatClient`] over the Slack Web API
//! - **history**: paginated channel search used to classify retries
//!
//! [`Notifier`] is the only path for user-visible alerts. It posts to the
//! channel and, when a status ledger is configured, records the message per
//! package so retry classification does not depend on chat history.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::ledger::StatusLedger;

pub mod history;
pub mod slack;

pub use history::NotificationHistory;
pub use slack::SlackClient;

/// A message as seen in the channel or the status ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            created_at,
        }
    }

    pub fn indicates_error(&self) -> bool {
        self.text.to_lowercase().contains("error")
    }

    /// An error message younger than `window` at `now`.
    pub fn is_recent_failure(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.indicates_error() && now - self.created_at < window
    }
}

/// One page of channel history, newest message first
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<NotificationRecord>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn post_message(&self, channel: &str, text: &str) -> PipelineResult<()>;

    async fn history_page(
        &self,
        channel: &str,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> PipelineResult<HistoryPage>;
}

/// Source of the most recent status message for a package
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn latest_for(&self, package_key: &str) -> PipelineResult<Option<NotificationRecord>>;
}

/// Sends alerts to the notification channel
#[derive(Clone)]
pub struct Notifier {
    chat: Arc<dyn ChatClient>,
    channel: String,
    ledger: Option<Arc<StatusLedger>>,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatClient>, channel: impl Into<String>) -> Self {
        Self {
            chat,
            channel: channel.into(),
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<StatusLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Post `text` and, for package-scoped messages, record it in the ledger.
    pub async fn send(&self, package_key: Option<&str>, text: &str) -> PipelineResult<()> {
        let posted = self.chat.post_message(&self.channel, text).await;

        if let (Some(ledger), Some(package_key)) = (&self.ledger, package_key) {
            let record = NotificationRecord::new(text, Utc::now());
            if let Err(e) = ledger.record(package_key, &record).await {
                warn!(package = %package_key, error = %e, "Failed to record status in ledger");
            }
        }

        posted?;
        info!(channel = %self.channel, "Notification sent");
        Ok(())
    }

    /// Like [`Notifier::send`] but only logs delivery failures.
    pub async fn send_best_effort(&self, package_key: Option<&str>, text: &str) {
        if let Err(e) = self.send(package_key, text).await {
            warn!(channel = %self.channel, error = %e, text, "Failed to deliver notification");
        }
    }
}

/// Outcome-triggered notification attached to a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunHook {
    OnSuccess(String),
    OnFailure(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSet {
    hooks: Vec<RunHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, text: impl Into<String>) -> Self {
        self.hooks.push(RunHook::OnSuccess(text.into()));
        self
    }

    pub fn on_failure(mut self, text: impl Into<String>) -> Self {
        self.hooks.push(RunHook::OnFailure(text.into()));
        self
    }

    pub fn hooks(&self) -> &[RunHook] {
        &self.hooks
    }

    pub fn has_failure_hook(&self) -> bool {
        self.hooks.iter().any(|h| matches!(h, RunHook::OnFailure(_)))
    }

    /// Messages that fire for the given outcome, in attachment order.
    pub fn messages_for(&self, succeeded: bool) -> impl Iterator<Item = &str> {
        self.hooks.iter().filter_map(move |hook| match (hook, succeeded) {
            (RunHook::OnSuccess(text), true) | (RunHook::OnFailure(text), false) => {
                Some(text.as_str())
            },
            _ => None,
        })
    }

    pub async fn fire(&self, notifier: &Notifier, package_key: &str, succeeded: bool) {
        for text in self.messages_for(succeeded) {
            notifier.send_best_effort(Some(package_key), text).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_recent_failure_classification() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let window = Duration::minutes(30);

        let recent = NotificationRecord::new("pkg: An error occurred", now - Duration::minutes(10));
        assert!(recent.is_recent_failure(now, window));

        let stale = NotificationRecord::new("pkg: An error occurred", now - Duration::minutes(45));
        assert!(!stale.is_recent_failure(now, window));

        let success = NotificationRecord::new("pkg: Successfully finished", now);
        assert!(!success.is_recent_failure(now, window));
    }

    #[test]
    fn test_error_detection_ignores_case() {
        let record = NotificationRecord::new("pkg: ERROR while loading", Utc::now());
        assert!(record.indicates_error());
    }

    #[test]
    fn test_hook_set_selects_by_outcome() {
        let hooks = HookSet::new().on_success("done").on_failure("failed");

        assert_eq!(hooks.messages_for(true).collect::<Vec<_>>(), vec!["done"]);
        assert_eq!(hooks.messages_for(false).collect::<Vec<_>>(), vec!["failed"]);
        assert!(hooks.has_failure_hook());
        assert!(!HookSet::new().on_success("x").has_failure_hook());
    }
}
