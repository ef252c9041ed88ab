//! Cursor-driven upload scheduler

use std::collections::HashSet;
use std::sync::Arc;
use subdwh_common::UploadState;
use tracing::{debug, info, instrument, warn};

use super::{RunRequest, TickOutcome};
use crate::error::{PipelineError, PipelineResult};
use crate::state::{Cursor, StateStore};
use crate::storage::ObjectStore;

/// Finds output files awaiting upload and requests a LoadJob for them
///
/// The cursor only orders the request: keys newer than it come first. It is
/// advanced as soon as new keys are seen, before anything is loaded, and a
/// metadata rewrite moves a file's last-modified time past it. Completeness
/// therefore rests on the pending sweep, which every tick runs over the whole
/// prefix.
pub struct UploadScheduler {
    store: Arc<dyn ObjectStore>,
    state: Arc<dyn StateStore>,
    output_prefix: String,
}

impl UploadScheduler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        state: Arc<dyn StateStore>,
        output_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            state,
            output_prefix: output_prefix.into(),
        }
    }

    #[instrument(skip(self), fields(prefix = %self.output_prefix))]
    pub async fn tick(&self) -> PipelineResult<TickOutcome> {
        let cursor = self.state.get_cursor().await?;
        let new_keys = self
            .store
            .list_since(&self.output_prefix, cursor.as_ref().map(Cursor::as_str))
            .await
            .map_err(PipelineError::storage)?;

        let Some(last) = new_keys.last() else {
            debug!(cursor = ?cursor, "No new output files since cursor");
            let pending = self.pending_keys().await?;
            if pending.is_empty() {
                return Ok(TickOutcome::skipped("no new output files"));
            }
            info!(files = pending.len(), "Requesting load of previously pending files");
            return Ok(TickOutcome::Dispatched {
                requests: vec![RunRequest::load(pending)],
            });
        };

        self.state.set_cursor(&Cursor::new(last.clone())).await?;
        info!(new = new_keys.len(), cursor = %last, "Advanced upload cursor");

        let mut candidates = new_keys;
        candidates.extend(
            self.store
                .list_keys(&self.output_prefix)
                .await
                .map_err(PipelineError::storage)?,
        );

        let awaiting = self.filter_awaiting(candidates).await;
        if awaiting.is_empty() {
            return Ok(TickOutcome::skipped("no files awaiting upload"));
        }

        info!(files = awaiting.len(), "Requesting load");
        Ok(TickOutcome::Dispatched {
            requests: vec![RunRequest::load(awaiting)],
        })
    }

    /// Every file under the output prefix still awaiting upload.
    #[instrument(skip(self))]
    pub async fn pending_keys(&self) -> PipelineResult<Vec<String>> {
        let keys = self
            .store
            .list_since(&self.output_prefix, None)
            .await
            .map_err(PipelineError::storage)?;
        Ok(self.filter_awaiting(keys).await)
    }

    /// Keep keys whose state is `AWAITING_UPLOAD`, first occurrence order.
    async fn filter_awaiting(&self, keys: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut awaiting = Vec::new();

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.state.get_state(&key).await {
                Ok(Some(UploadState::AwaitingUpload)) => awaiting.push(key),
                Ok(_) => {},
                // A later tick sees the file again through the sweep.
                Err(e) => warn!(file = %key, error = %e, "Could not read upload state"),
            }
        }

        awaiting
    }
}
