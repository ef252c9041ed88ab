//! Notification history search

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use subdwh_common::types::NOTIFICATION_LOOKBACK_SECS;
use tracing::{debug, instrument};

use super::{ChatClient, NotificationRecord, RunHistory};
use crate::error::PipelineResult;

/// Finds the latest channel message mentioning a package
///
/// The search is bounded to a look-back window (one day by default) and walks
/// every page inside it before giving up.
pub struct NotificationHistory {
    chat: Arc<dyn ChatClient>,
    channel: String,
    lookback: Duration,
}

impl NotificationHistory {
    pub fn new(chat: Arc<dyn ChatClient>, channel: impl Into<String>) -> Self {
        Self {
            chat,
            channel: channel.into(),
            lookback: Duration::seconds(NOTIFICATION_LOOKBACK_SECS),
        }
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Most recent message containing `package_key`, scanning back from `now`.
    #[instrument(skip(self))]
    pub async fn latest_message_for(
        &self,
        package_key: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<NotificationRecord>> {
        let oldest = now - self.lookback;
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .chat
                .history_page(&self.channel, oldest, now, cursor.as_deref())
                .await?;
            pages += 1;

            if let Some(found) = page
                .messages
                .into_iter()
                .find(|m| m.text.contains(package_key))
            {
                debug!(pages, "Found notification for package");
                return Ok(Some(found));
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pages, "No notification for package within look-back window");
        Ok(None)
    }
}

#[async_trait]
impl RunHistory for NotificationHistory {
    async fn latest_for(&self, package_key: &str) -> PipelineResult<Option<NotificationRecord>> {
        self.latest_message_for(package_key, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingChat;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_paginates_until_match() {
        let chat = Arc::new(RecordingChat::new());
        chat.push_history_page(vec![NotificationRecord::new("other.spkg: done", now())]);
        chat.push_history_page(vec![
            NotificationRecord::new("spkgs/a.spkg: An error occurred", now() - Duration::minutes(5)),
            NotificationRecord::new("spkgs/a.spkg: Started", now() - Duration::minutes(50)),
        ]);

        let history = NotificationHistory::new(chat.clone(), "alerts");
        let found = history
            .latest_message_for("spkgs/a.spkg", now())
            .await
            .unwrap()
            .unwrap();

        assert!(found.text.contains("An error occurred"));
        assert_eq!(chat.history_requests(), 2);
    }

    #[tokio::test]
    async fn test_exhausts_window_without_match() {
        let chat = Arc::new(RecordingChat::new());
        chat.push_history_page(vec![NotificationRecord::new("x: done", now())]);
        chat.push_history_page(vec![NotificationRecord::new("y: done", now())]);
        chat.push_history_page(vec![]);

        let history = NotificationHistory::new(chat.clone(), "alerts");
        assert!(history
            .latest_message_for("spkgs/a.spkg", now())
            .await
            .unwrap()
            .is_none());
        assert_eq!(chat.history_requests(), 3);
    }

    #[tokio::test]
    async fn test_requests_one_day_window() {
        let chat = Arc::new(RecordingChat::new());
        let history = NotificationHistory::new(chat.clone(), "alerts");

        history.latest_message_for("pkg", now()).await.unwrap();

        let (oldest, latest) = chat.last_history_window().unwrap();
        assert_eq!(latest, now());
        assert_eq!(latest - oldest, Duration::days(1));
    }
}
