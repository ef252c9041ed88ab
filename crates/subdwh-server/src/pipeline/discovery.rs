//! Package discovery

use std::sync::Arc;
use tracing::{info, instrument};

use super::{RunRequest, TickOutcome};
use crate::error::{PipelineError, PipelineResult};
use crate::storage::ObjectStore;

/// Lists packages and requests one processing run per package
///
/// Run keys depend only on the package key, so repeated ticks over unchanged
/// storage yield identical requests and the runtime can drop the duplicates.
pub struct PackageDiscoveryScheduler {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    extension: String,
}

impl PackageDiscoveryScheduler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn tick(&self) -> PipelineResult<TickOutcome> {
        let mut keys: Vec<String> = self
            .store
            .list_keys(&self.prefix)
            .await
            .map_err(PipelineError::storage)?
            .into_iter()
            .filter(|key| key.ends_with(&self.extension))
            .collect();
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            info!("No packages found");
            return Ok(TickOutcome::skipped(format!(
                "no {} packages under {}",
                self.extension, self.prefix
            )));
        }

        info!(packages = keys.len(), "Requesting package processing");

        Ok(TickOutcome::Dispatched {
            requests: keys.into_iter().map(RunRequest::process).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MemoryStore;

    fn scheduler(store: &Arc<MemoryStore>) -> PackageDiscoveryScheduler {
        PackageDiscoveryScheduler::new(store.clone(), "spkgs/", ".spkg")
    }

    #[tokio::test]
    async fn test_emits_one_request_per_package() {
        let store = Arc::new(MemoryStore::new("packages"));
        store.insert_object("spkgs/uniswap.spkg", "pkg");
        store.insert_object("spkgs/aave.spkg", "pkg");
        store.insert_object("spkgs/README.md", "docs");
        store.insert_object("cli/messari_cli", "bin");

        let outcome = scheduler(&store).tick().await.unwrap();
        let keys: Vec<&str> = outcome.requests().iter().map(|r| r.dedup_key()).collect();

        assert_eq!(keys, vec!["spkgs/aave.spkg", "spkgs/uniswap.spkg"]);
    }

    #[tokio::test]
    async fn test_dedup_keys_are_stable_across_ticks() {
        let store = Arc::new(MemoryStore::new("packages"));
        store.insert_object("spkgs/a.spkg", "pkg");
        store.insert_object("spkgs/b.spkg", "pkg");
        let scheduler = scheduler(&store);

        let first = scheduler.tick().await.unwrap();
        let second = scheduler.tick().await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_no_packages_is_skipped() {
        let store = Arc::new(MemoryStore::new("packages"));
        let outcome = scheduler(&store).tick().await.unwrap();
        assert!(outcome.is_skipped());
    }
}
