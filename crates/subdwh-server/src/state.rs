//! Durable pipeline state
//!
//! Upload state lives in each output file's user metadata and the upload
//! cursor in a small object of its own. The underlying store offers no
//! cross-object transactions: every call here touches exactly one object.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use subdwh_common::types::UPLOAD_STATE_METADATA_KEY;
use subdwh_common::UploadState;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::storage::ObjectStore;

/// Opaque checkpoint: the last output key the upload scheduler observed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when the file carries no recognised upload state.
    async fn get_state(&self, file_key: &str) -> PipelineResult<Option<UploadState>>;

    /// Write `state`; returns `false` when the file already had it.
    async fn set_state(&self, file_key: &str, state: UploadState) -> PipelineResult<bool>;

    async fn get_cursor(&self) -> PipelineResult<Option<Cursor>>;

    async fn set_cursor(&self, cursor: &Cursor) -> PipelineResult<()>;
}

/// [`StateStore`] over object metadata
pub struct ObjectStateStore {
    store: Arc<dyn ObjectStore>,
    cursor_key: String,
}

impl ObjectStateStore {
    pub fn new(store: Arc<dyn ObjectStore>, cursor_key: impl Into<String>) -> Self {
        Self {
            store,
            cursor_key: cursor_key.into(),
        }
    }
}

#[async_trait]
impl StateStore for ObjectStateStore {
    async fn get_state(&self, file_key: &str) -> PipelineResult<Option<UploadState>> {
        let metadata = self
            .store
            .head_metadata(file_key)
            .await
            .map_err(PipelineError::storage)?;

        Ok(match metadata.get(UPLOAD_STATE_METADATA_KEY) {
            None => None,
            Some(raw) => match raw.parse::<UploadState>() {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(key = %file_key, error = %e, "Ignoring unrecognised upload state");
                    None
                },
            },
        })
    }

    async fn set_state(&self, file_key: &str, state: UploadState) -> PipelineResult<bool> {
        let mut metadata = self
            .store
            .head_metadata(file_key)
            .await
            .map_err(PipelineError::storage)?;

        let current = metadata
            .get(UPLOAD_STATE_METADATA_KEY)
            .and_then(|raw| raw.parse::<UploadState>().ok());

        if let Some(current) = current {
            if current == state {
                debug!(key = %file_key, %state, "Upload state already set");
                return Ok(false);
            }
            if !current.can_transition_to(state) {
                return Err(PipelineError::InvalidTransition {
                    key: file_key.to_string(),
                    from: current,
                    to: state,
                });
            }
        }

        metadata.insert(UPLOAD_STATE_METADATA_KEY.to_string(), state.as_str().to_string());
        self.store
            .replace_metadata(file_key, metadata)
            .await
            .map_err(PipelineError::storage)?;

        debug!(key = %file_key, %state, "Upload state written");
        Ok(true)
    }

    async fn get_cursor(&self) -> PipelineResult<Option<Cursor>> {
        let bytes = self
            .store
            .get_bytes(&self.cursor_key)
            .await
            .map_err(PipelineError::storage)?;

        Ok(bytes
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Cursor))
    }

    async fn set_cursor(&self, cursor: &Cursor) -> PipelineResult<()> {
        self.store
            .put_bytes(
                &self.cursor_key,
                cursor.as_str().as_bytes().to_vec(),
                Some("text/plain"),
            )
            .await
            .map_err(PipelineError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MemoryStore;

    fn state_store(store: &Arc<MemoryStore>) -> ObjectStateStore {
        ObjectStateStore::new(store.clone(), "checkpoints/upload_cursor")
    }

    #[tokio::test]
    async fn test_get_state_reads_metadata() {
        let store = Arc::new(MemoryStore::new("data"));
        store.insert_output("substreams/a.parquet", Some(UploadState::AwaitingUpload));
        store.insert_output("substreams/b.parquet", None);

        let states = state_store(&store);
        assert_eq!(
            states.get_state("substreams/a.parquet").await.unwrap(),
            Some(UploadState::AwaitingUpload)
        );
        assert_eq!(states.get_state("substreams/b.parquet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_state_is_idempotent() {
        let store = Arc::new(MemoryStore::new("data"));
        store.insert_output("substreams/a.parquet", Some(UploadState::AwaitingUpload));
        let states = state_store(&store);

        assert!(states
            .set_state("substreams/a.parquet", UploadState::Uploaded)
            .await
            .unwrap());
        assert!(!states
            .set_state("substreams/a.parquet", UploadState::Uploaded)
            .await
            .unwrap());
        assert_eq!(store.metadata_writes("substreams/a.parquet"), 1);
    }

    #[tokio::test]
    async fn test_set_state_never_reverses() {
        let store = Arc::new(MemoryStore::new("data"));
        store.insert_output("substreams/a.parquet", Some(UploadState::Uploaded));
        let states = state_store(&store);

        let err = states
            .set_state("substreams/a.parquet", UploadState::AwaitingUpload)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_set_state_preserves_other_metadata() {
        let store = Arc::new(MemoryStore::new("data"));
        store.insert_with_metadata(
            "substreams/a.parquet",
            [
                (UPLOAD_STATE_METADATA_KEY, UploadState::AwaitingUpload.as_str()),
                ("producer", "messari"),
            ],
        );
        let states = state_store(&store);

        states
            .set_state("substreams/a.parquet", UploadState::Uploaded)
            .await
            .unwrap();

        let metadata = store.metadata("substreams/a.parquet");
        assert_eq!(metadata.get("producer").map(String::as_str), Some("messari"));
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let store = Arc::new(MemoryStore::new("data"));
        let states = state_store(&store);

        assert_eq!(states.get_cursor().await.unwrap(), None);
        states
            .set_cursor(&Cursor::new("substreams/b.parquet"))
            .await
            .unwrap();
        assert_eq!(
            states.get_cursor().await.unwrap(),
            Some(Cursor::new("substreams/b.parquet"))
        );
    }
}
