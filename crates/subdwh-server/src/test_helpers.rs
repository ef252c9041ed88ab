//! In-memory collaborators for tests
//!
//! Every external contract the pipelines depend on has a fake here, so unit
//! tests and the integration tests under `tests/` can drive full ticks without
//! S3, Slack, Snowflake or the package binary.
//!
//! # Examples
//!
//! ```rust,ignore
//! use subdwh_server::test_helpers::*;
//!
//! let store = Arc::new(MemoryStore::new("data"));
//! store.insert_output("substreams/pkg/t/a.parquet", Some(UploadState::AwaitingUpload));
//! let warehouse = Arc::new(RecordingWarehouse::new());
//! // ... build a LoadJob and run it ...
//! assert_eq!(warehouse.statements().len(), 2);
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use subdwh_common::types::UPLOAD_STATE_METADATA_KEY;
use subdwh_common::UploadState;

use crate::binary::{PackageBinary, TokenIssuer};
use crate::error::{PipelineError, PipelineResult};
use crate::notify::{ChatClient, HistoryPage, NotificationRecord, RunHistory};
use crate::storage::{ObjectStore, ObjectSummary};
use crate::warehouse::Warehouse;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Object storage
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
}

/// [`ObjectStore`] backed by a map
///
/// Each insert gets a strictly later `last_modified`, so listing order follows
/// insertion order like freshly written S3 objects do.
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    metadata_writes: Mutex<HashMap<String, usize>>,
    failing_metadata: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
    clock: AtomicI64,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            metadata_writes: Mutex::new(HashMap::new()),
            failing_metadata: Mutex::new(HashSet::new()),
            list_calls: AtomicUsize::new(0),
            clock: AtomicI64::new(0),
        }
    }

    fn tick(&self) -> DateTime<Utc> {
        let offset = self.clock.fetch_add(1, Ordering::SeqCst);
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
            + Duration::seconds(offset)
    }

    fn insert(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) {
        let object = MemoryObject {
            data,
            metadata,
            last_modified: self.tick(),
        };
        lock(&self.objects).insert(key.to_string(), object);
    }

    pub fn insert_object(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.insert(key, data.into(), HashMap::new());
    }

    /// An output file, optionally tagged with an upload state.
    pub fn insert_output(&self, key: &str, state: Option<UploadState>) {
        let metadata = state
            .map(|s| {
                HashMap::from([(UPLOAD_STATE_METADATA_KEY.to_string(), s.as_str().to_string())])
            })
            .unwrap_or_default();
        self.insert(key, b"PAR1".to_vec(), metadata);
    }

    pub fn insert_with_metadata<'a>(
        &self,
        key: &str,
        metadata: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let metadata = metadata
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.insert(key, b"PAR1".to_vec(), metadata);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn metadata(&self, key: &str) -> HashMap<String, String> {
        lock(&self.objects)
            .get(key)
            .map(|o| o.metadata.clone())
            .unwrap_or_default()
    }

    pub fn state_of(&self, key: &str) -> Option<UploadState> {
        self.metadata(key)
            .get(UPLOAD_STATE_METADATA_KEY)
            .and_then(|v| v.parse().ok())
    }

    pub fn object_text(&self, key: &str) -> Option<String> {
        lock(&self.objects)
            .get(key)
            .map(|o| String::from_utf8_lossy(&o.data).into_owned())
    }

    /// Number of successful metadata replacements on `key`.
    pub fn metadata_writes(&self, key: &str) -> usize {
        lock(&self.metadata_writes).get(key).copied().unwrap_or(0)
    }

    pub fn total_metadata_writes(&self) -> usize {
        lock(&self.metadata_writes).values().sum()
    }

    /// Make every later metadata replacement on `key` fail.
    pub fn fail_metadata_writes_for(&self, key: &str) {
        lock(&self.failing_metadata).insert(key.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.objects)
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                last_modified: Some(object.last_modified),
                size: object.data.len() as i64,
            })
            .collect())
    }

    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        lock(&self.objects)
            .get(key)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}/{}", self.bucket, key))
    }

    async fn replace_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()> {
        if lock(&self.failing_metadata).contains(key) {
            bail!("injected metadata failure for {}", key);
        }

        // A copy-in-place rewrites the object, so it lists as freshly modified.
        let modified = self.tick();
        let mut objects = lock(&self.objects);
        let Some(object) = objects.get_mut(key) else {
            bail!("NoSuchKey: {}/{}", self.bucket, key);
        };
        object.metadata = metadata;
        object.last_modified = modified;
        drop(objects);

        *lock(&self.metadata_writes).entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let data = lock(&self.objects)
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}/{}", self.bucket, key))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.objects).get(key).map(|o| o.data.clone()))
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>, _content_type: Option<&str>) -> Result<()> {
        let metadata = lock(&self.objects)
            .get(key)
            .map(|o| o.metadata.clone())
            .unwrap_or_default();
        self.insert(key, data, metadata);
        Ok(())
    }
}

// ============================================================================
// Chat
// ============================================================================

/// [`ChatClient`] that records posts and serves queued history pages
#[derive(Default)]
pub struct RecordingChat {
    posted: Mutex<Vec<(String, String)>>,
    pages: Mutex<VecDeque<Vec<NotificationRecord>>>,
    history_requests: AtomicUsize,
    last_window: Mutex<Option<(DateTime<Utc>, DateTime<Utc>)>>,
    fail_posts: Mutex<bool>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a page; pages are served in push order.
    pub fn push_history_page(&self, messages: Vec<NotificationRecord>) {
        lock(&self.pages).push_back(messages);
    }

    pub fn fail_posts(&self, fail: bool) {
        *lock(&self.fail_posts) = fail;
    }

    pub fn posted(&self) -> Vec<(String, String)> {
        lock(&self.posted).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.posted).iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn history_requests(&self) -> usize {
        self.history_requests.load(Ordering::SeqCst)
    }

    pub fn last_history_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        *lock(&self.last_window)
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn post_message(&self, channel: &str, text: &str) -> PipelineResult<()> {
        if *lock(&self.fail_posts) {
            return Err(PipelineError::Notification("channel_not_found".into()));
        }
        lock(&self.posted).push((channel.to_string(), text.to_string()));
        Ok(())
    }

    async fn history_page(
        &self,
        _channel: &str,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
        _cursor: Option<&str>,
    ) -> PipelineResult<HistoryPage> {
        let served = self.history_requests.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_window) = Some((oldest, latest));

        let mut pages = lock(&self.pages);
        let messages = pages.pop_front().unwrap_or_default();
        let next_cursor = (!pages.is_empty()).then(|| format!("page-{}", served + 1));

        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }
}

/// [`RunHistory`] returning a fixed record
pub struct FixedHistory(pub Option<NotificationRecord>);

impl FixedHistory {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn with(text: &str, created_at: DateTime<Utc>) -> Self {
        Self(Some(NotificationRecord::new(text, created_at)))
    }
}

#[async_trait]
impl RunHistory for FixedHistory {
    async fn latest_for(&self, _package_key: &str) -> PipelineResult<Option<NotificationRecord>> {
        Ok(self.0.clone())
    }
}

// ============================================================================
// Package binary and auth
// ============================================================================

/// [`PackageBinary`] with a canned `block-range-info` response
pub struct FakeBinary {
    response: String,
    process_failure: Option<String>,
    block_range_calls: AtomicUsize,
    process_calls: AtomicUsize,
    last_token: Mutex<Option<String>>,
}

impl FakeBinary {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            process_failure: None,
            block_range_calls: AtomicUsize::new(0),
            process_calls: AtomicUsize::new(0),
            last_token: Mutex::new(None),
        }
    }

    pub fn with_range(start: u64, stop: u64) -> Self {
        Self::new(&format!(r#"{{"start_block": {start}, "stop_block": {stop}}}"#))
    }

    /// Make `process` exit non-zero with `stderr`.
    pub fn failing_process(mut self, stderr: &str) -> Self {
        self.process_failure = Some(stderr.to_string());
        self
    }

    pub fn block_range_calls(&self) -> usize {
        self.block_range_calls.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        lock(&self.last_token).clone()
    }
}

#[async_trait]
impl PackageBinary for FakeBinary {
    async fn block_range_info(&self, _package_path: &Path) -> PipelineResult<String> {
        self.block_range_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }

    async fn process(&self, package_path: &Path, token: &str) -> PipelineResult<()> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_token) = Some(token.to_string());

        match &self.process_failure {
            Some(stderr) => Err(PipelineError::ExternalCommand {
                command: format!("messari_cli process {}", package_path.display()),
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

pub struct FakeTokenIssuer {
    token: Option<String>,
    calls: AtomicUsize,
}

impl FakeTokenIssuer {
    pub fn ok(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            token: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for FakeTokenIssuer {
    async fn issue_token(&self) -> PipelineResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .ok_or_else(|| PipelineError::Authentication("401 Unauthorized".into()))
    }
}

// ============================================================================
// Warehouse
// ============================================================================

/// [`Warehouse`] that records statements and fails on chosen tables
#[derive(Default)]
pub struct RecordingWarehouse {
    statements: Mutex<Vec<String>>,
    failing_copy_tables: Mutex<HashSet<String>>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `COPY INTO <table>` statement.
    pub fn fail_copy_into(&self, table: &str) {
        lock(&self.failing_copy_tables).insert(table.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_copy_tables).clear();
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    pub fn statements_for(&self, table: &str) -> Vec<String> {
        let create = format!("CREATE TABLE IF NOT EXISTS {}\n", table);
        let copy = format!("COPY INTO {}\n", table);
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with(&create) || s.starts_with(&copy))
            .collect()
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn execute(&self, statement: &str) -> PipelineResult<()> {
        lock(&self.statements).push(statement.to_string());

        let failing = lock(&self.failing_copy_tables)
            .iter()
            .any(|table| statement.starts_with(&format!("COPY INTO {}\n", table)));
        if failing {
            return Err(PipelineError::Warehouse(
                "002003 (42S02): SQL compilation error".into(),
            ));
        }
        Ok(())
    }
}
