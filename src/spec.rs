//! Value descriptions of storages and filesystems
//!
//! Specs are cache keys for the [`crate::provider::Provider`]: two equal
//! specs always resolve to the same instance.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::events::EventListener;

/// A backend instance: identifier plus URI (`scheme://authority/path?query`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct StorageSpec {
    pub id: String,
    pub uri: String,
}

impl StorageSpec {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
        }
    }
}

/// A storage grafted in at a mount point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct MountSpec {
    pub mount_point: PathBuf,
    pub storage: StorageSpec,
}

impl MountSpec {
    pub fn new(mount_point: impl Into<PathBuf>, storage: StorageSpec) -> Self {
        Self {
            mount_point: mount_point.into(),
            storage,
        }
    }
}

/// Root storage, ordered mounts and an optional listener
///
/// The listener takes part in equality by identity: the same layout with a
/// different listener object is a different filesystem.
#[derive(Clone)]
pub struct FileSystemSpec {
    pub root: StorageSpec,
    pub mounts: Vec<MountSpec>,
    pub listener: Option<Arc<dyn EventListener>>,
}

impl FileSystemSpec {
    pub fn new(root: StorageSpec) -> Self {
        Self {
            root,
            mounts: Vec::new(),
            listener: None,
        }
    }

    pub fn with_mount(mut self, mount_point: impl Into<PathBuf>, storage: StorageSpec) -> Self {
        self.mounts.push(MountSpec::new(mount_point, storage));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn listener_ptr(&self) -> Option<*const ()> {
        self.listener
            .as_ref()
            .map(|l| Arc::as_ptr(l) as *const ())
    }
}

impl PartialEq for FileSystemSpec {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.mounts == other.mounts
            && self.listener_ptr() == other.listener_ptr()
    }
}

impl Eq for FileSystemSpec {}

impl Hash for FileSystemSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        self.mounts.hash(state);
        self.listener_ptr().map(|p| p as usize).hash(state);
    }
}

impl fmt::Debug for FileSystemSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemSpec")
            .field("root", &self.root)
            .field("mounts", &self.mounts)
            .field("listener", &self.listener_ptr())
            .finish()
    }
}
