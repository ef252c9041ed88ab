//! Processing status ledger
//!
//! One JSON object per package holding the last status message sent for it.
//! Retry classification reads this instead of scanning chat history, so the
//! notification transport is no longer the source of truth.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{PipelineError, PipelineResult};
use crate::notify::{NotificationRecord, RunHistory};
use crate::storage::ObjectStore;

pub struct StatusLedger {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn entry_key(&self, package_key: &str) -> String {
        format!("{}{}.json", self.prefix, package_key.trim_start_matches('/'))
    }

    #[instrument(skip(self, record))]
    pub async fn record(&self, package_key: &str, record: &NotificationRecord) -> PipelineResult<()> {
        let body = serde_json::to_vec(record)?;
        self.store
            .put_bytes(&self.entry_key(package_key), body, Some("application/json"))
            .await
            .map_err(PipelineError::storage)?;
        debug!("Recorded package status");
        Ok(())
    }
}

#[async_trait]
impl RunHistory for StatusLedger {
    async fn latest_for(&self, package_key: &str) -> PipelineResult<Option<NotificationRecord>> {
        let bytes = self
            .store
            .get_bytes(&self.entry_key(package_key))
            .await
            .map_err(PipelineError::storage)?;

        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_latest_record_replaces_previous() {
        let store = Arc::new(MemoryStore::new("data"));
        let ledger = StatusLedger::new(store.clone(), "status/");

        assert!(ledger.latest_for("spkgs/a.spkg").await.unwrap().is_none());

        ledger
            .record("spkgs/a.spkg", &NotificationRecord::new("started", Utc::now()))
            .await
            .unwrap();
        ledger
            .record("spkgs/a.spkg", &NotificationRecord::new("An error occurred", Utc::now()))
            .await
            .unwrap();

        let latest = ledger.latest_for("spkgs/a.spkg").await.unwrap().unwrap();
        assert!(latest.indicates_error());
        assert!(store.contains("status/spkgs/a.spkg.json"));
    }
}
