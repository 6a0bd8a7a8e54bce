//! Common test utilities and fixtures
//!
//! Storage builders, read/write helpers, a listener that records every
//! notification and a storage wrapper that injects delete failures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use cloudfs::error::CloudFsError;
use cloudfs::events::{Event, EventListener};
use cloudfs::filesystem::{Filesystem, Mount};
use cloudfs::provider::{BackendRegistry, Provider, StorageFactory};
use cloudfs::spec::StorageSpec;
use cloudfs::storage::memory::MemoryStorage;
use cloudfs::storage::{read_to_end, write_all, File, NodeInfo, Storage};

// ============================================================================
// Storage fixtures
// ============================================================================

pub fn memory(id: &str) -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new(id))
}

/// Filesystem over a memory root with one memory storage per mount point
pub fn memory_filesystem(points: &[&str]) -> Result<Filesystem> {
    let mounts = points
        .iter()
        .map(|point| Mount::new(point, memory(point)))
        .collect::<cloudfs::Result<Vec<_>>>()?;
    Ok(Filesystem::new("tenant", memory("root"), mounts))
}

// ============================================================================
// File utilities
// ============================================================================

/// Create or replace a file through `open`/`write`/`close`
pub async fn write_file(storage: &dyn Storage, path: &str, content: &[u8]) -> Result<()> {
    let mut file = storage.open(Path::new(path)).await?;
    file.truncate(0).await?;
    write_all(file.as_mut(), content).await?;
    file.close().await?;
    Ok(())
}

pub async fn read_file(storage: &dyn Storage, path: &str) -> Result<Vec<u8>> {
    let mut file = storage.open(Path::new(path)).await?;
    let data = read_to_end(file.as_mut()).await?;
    file.close().await?;
    Ok(data)
}

/// Assert that `path` exists on `storage`
pub async fn assert_exists(storage: &dyn Storage, path: &str) {
    let exists = storage.exists(Path::new(path)).await.unwrap_or(false);
    assert!(exists, "Expected {:?} to exist on {}", path, storage.id());
}

/// Assert that `path` does not exist on `storage`
pub async fn assert_not_exists(storage: &dyn Storage, path: &str) {
    let exists = storage.exists(Path::new(path)).await.unwrap_or(true);
    assert!(!exists, "Expected {:?} not to exist on {}", path, storage.id());
}

// ============================================================================
// Listeners
// ============================================================================

/// Listener that records every notification in delivery order
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventListener for RecordingListener {
    fn moved(&self, src: &Path, dst: &Path) {
        self.events.lock().push(Event::moved(src, dst));
    }

    fn changed(&self, path: &Path) {
        self.events.lock().push(Event::changed(path));
    }

    fn deleted(&self, path: &Path) {
        self.events.lock().push(Event::deleted(path));
    }
}

// ============================================================================
// Construction counting
// ============================================================================

/// Memory-backed factory that counts constructions per storage id and
/// yields mid-build so concurrent callers interleave
#[derive(Default)]
pub struct CountingFactory {
    built: Mutex<HashMap<String, usize>>,
}

impl CountingFactory {
    /// Number of times the storage with `id` was built
    pub fn built(&self, id: &str) -> usize {
        self.built.lock().get(id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.built.lock().values().sum()
    }
}

#[async_trait]
impl StorageFactory for CountingFactory {
    async fn build(&self, spec: &StorageSpec, _url: &url::Url) -> cloudfs::Result<Arc<dyn Storage>> {
        *self.built.lock().entry(spec.id.clone()).or_insert(0) += 1;
        tokio::task::yield_now().await;
        Ok(Arc::new(MemoryStorage::new(spec.id.clone())))
    }
}

/// Provider whose only scheme, `counted://`, is served by the returned factory
pub fn counting_provider() -> (Arc<Provider>, Arc<CountingFactory>) {
    let factory = Arc::new(CountingFactory::default());
    let mut registry = BackendRegistry::new();
    registry.register("counted", factory.clone());
    (Arc::new(Provider::new(registry)), factory)
}

// ============================================================================
// Failure injection
// ============================================================================

/// Delegates everything to `inner` except `delete`, which always fails
pub struct DeleteRejectingStorage {
    inner: Arc<dyn Storage>,
}

impl DeleteRejectingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Storage for DeleteRejectingStorage {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn open(&self, path: &Path) -> cloudfs::Result<Box<dyn File>> {
        self.inner.open(path).await
    }

    async fn stat(&self, path: &Path) -> cloudfs::Result<NodeInfo> {
        self.inner.stat(path).await
    }

    async fn delete(&self, path: &Path) -> cloudfs::Result<()> {
        Err(CloudFsError::PermissionDenied(format!(
            "delete of {:?} rejected",
            path
        )))
    }

    async fn copy(&self, src: &Path, dst: &Path) -> cloudfs::Result<()> {
        self.inner.copy(src, dst).await
    }

    async fn move_to(&self, src: &Path, dst: &Path) -> cloudfs::Result<()> {
        self.inner.move_to(src, dst).await
    }

    async fn list_dir(&self, path: &Path, recursive: bool) -> cloudfs::Result<Vec<NodeInfo>> {
        self.inner.list_dir(path, recursive).await
    }

    async fn mkdir(&self, path: &Path) -> cloudfs::Result<NodeInfo> {
        self.inner.mkdir(path).await
    }
}
