//! Spec-keyed construction and caching of storages and filesystems
//!
//! A [`Provider`] builds each distinct [`StorageSpec`] and
//! [`FileSystemSpec`] at most once and hands out shared instances
//! afterwards. Construction is keyed by URI scheme through a
//! [`BackendRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::error::{CloudFsError, Result};
use crate::filesystem::{Filesystem, Mount};
use crate::spec::{FileSystemSpec, StorageSpec};
use crate::storage::local::LocalStorage;
use crate::storage::memory::MemoryStorage;
use crate::storage::s3::S3Storage;
use crate::storage::Storage;

/// Builds a storage for one URI scheme
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn build(&self, spec: &StorageSpec, url: &Url) -> Result<Arc<dyn Storage>>;
}

struct LocalFactory;

#[async_trait]
impl StorageFactory for LocalFactory {
    async fn build(&self, spec: &StorageSpec, url: &Url) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(LocalStorage::from_url(&spec.id, url)?))
    }
}

struct MemoryFactory;

#[async_trait]
impl StorageFactory for MemoryFactory {
    async fn build(&self, spec: &StorageSpec, url: &Url) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(MemoryStorage::from_url(&spec.id, url)?))
    }
}

struct S3Factory;

#[async_trait]
impl StorageFactory for S3Factory {
    async fn build(&self, spec: &StorageSpec, url: &Url) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(S3Storage::from_url(&spec.id, url).await?))
    }
}

/// Scheme to factory table
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn StorageFactory>>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in backends: `local` (alias `file`),
    /// `memory` and `s3`
    pub fn with_defaults() -> Self {
        let local: Arc<dyn StorageFactory> = Arc::new(LocalFactory);
        let mut registry = Self::new();
        registry.register("local", local.clone());
        registry.register("file", local);
        registry.register("memory", Arc::new(MemoryFactory));
        registry.register("s3", Arc::new(S3Factory));
        registry
    }

    /// Add or replace the factory for `scheme`
    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn StorageFactory>) {
        self.factories.insert(scheme.into().to_ascii_lowercase(), factory);
    }

    pub fn get(&self, scheme: &str) -> Option<&Arc<dyn StorageFactory>> {
        self.factories.get(&scheme.to_ascii_lowercase())
    }

    /// Parse the spec URI and build a storage with the matching factory
    pub async fn build(&self, spec: &StorageSpec) -> Result<Arc<dyn Storage>> {
        let url = parse_uri(&spec.uri)?;
        let factory = self
            .get(url.scheme())
            .ok_or_else(|| CloudFsError::UnknownScheme(url.scheme().to_string()))?;
        factory.build(spec, &url).await
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Parse a storage URI. A leading `@` is ignored.
fn parse_uri(uri: &str) -> Result<Url> {
    let trimmed = uri.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
    Url::parse(trimmed).map_err(|e| CloudFsError::Config(format!("invalid storage URI {:?}: {}", uri, e)))
}

/// Caches of constructed storages and filesystems
///
/// Lookups go through the concurrent maps; construction is serialized per
/// cache so two concurrent requests for one spec never build twice.
pub struct Provider {
    registry: BackendRegistry,
    storages: DashMap<StorageSpec, Arc<dyn Storage>>,
    filesystems: DashMap<FileSystemSpec, Arc<Filesystem>>,
    storage_lock: Mutex<()>,
    filesystem_lock: Mutex<()>,
}

impl Provider {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            storages: DashMap::new(),
            filesystems: DashMap::new(),
            storage_lock: Mutex::new(()),
            filesystem_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Shared storage for `spec`, built on first request
    pub async fn provide_storage(&self, spec: &StorageSpec) -> Result<Arc<dyn Storage>> {
        if let Some(storage) = self.storages.get(spec) {
            return Ok(storage.clone());
        }

        let _guard = self.storage_lock.lock().await;
        // Another task may have finished building while we waited
        if let Some(storage) = self.storages.get(spec) {
            return Ok(storage.clone());
        }

        debug!("storage cache miss: {} ({})", spec.id, spec.uri);
        let storage = self.registry.build(spec).await?;
        info!("built storage {} from {}", spec.id, spec.uri);
        self.storages.insert(spec.clone(), storage.clone());
        Ok(storage)
    }

    /// Shared filesystem for `spec`, built on first request. The spec's
    /// listener, if any, is registered on the new filesystem.
    pub async fn provide_filesystem(&self, spec: &FileSystemSpec) -> Result<Arc<Filesystem>> {
        if let Some(fs) = self.filesystems.get(spec) {
            return Ok(fs.clone());
        }

        let _guard = self.filesystem_lock.lock().await;
        if let Some(fs) = self.filesystems.get(spec) {
            return Ok(fs.clone());
        }

        debug!("filesystem cache miss: root {}", spec.root.id);
        let root = self.provide_storage(&spec.root).await?;
        let mut mounts = Vec::with_capacity(spec.mounts.len());
        for mount in &spec.mounts {
            let storage = self.provide_storage(&mount.storage).await?;
            mounts.push(Mount::new(&mount.mount_point, storage)?);
        }

        let fs = Filesystem::new(spec.root.id.clone(), root, mounts);
        if let Some(listener) = &spec.listener {
            fs.add_event_listener(listener.clone());
        }
        let fs = Arc::new(fs);
        info!(
            "built filesystem {} with {} mount(s)",
            spec.root.id,
            spec.mounts.len()
        );
        self.filesystems.insert(spec.clone(), fs.clone());
        Ok(fs)
    }

    pub fn cached_storages(&self) -> usize {
        self.storages.len()
    }

    pub fn cached_filesystems(&self) -> usize {
        self.filesystems.len()
    }
}

impl Default for Provider {
    fn default() -> Self {
        Self::new(BackendRegistry::with_defaults())
    }
}
