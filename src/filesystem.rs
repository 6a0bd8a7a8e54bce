//! Mount router
//!
//! A [`Filesystem`] composes one root storage with storages grafted in at
//! mount points. Every path resolves to exactly one storage plus a path
//! relative to it; operations spanning two storages go through
//! [`crate::transfer`].
//!
//! ```text
//! /                      root storage
//! ├── /tmp/              memory://scratch
//! └── /archive/          s3://bucket/tenant
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{CloudFsError, Result};
use crate::events::{Event, EventFile, EventListener, EventPropagator};
use crate::storage::{normalize_path, same_storage, File, NodeInfo, Storage};
use crate::transfer::{check_overlap, manual_copy, manual_delete};

/// A storage grafted into the tree at `point`
#[derive(Clone)]
pub struct Mount {
    storage: Arc<dyn Storage>,
    point: PathBuf,
}

impl Mount {
    /// Normalize `point` and bind it to `storage`. `/` is rejected: the root
    /// storage is never a mount.
    pub fn new(point: impl AsRef<Path>, storage: Arc<dyn Storage>) -> Result<Self> {
        let point = normalize_path(point.as_ref());
        if point == Path::new("/") {
            return Err(CloudFsError::InvalidPath(
                "cannot mount a storage at /".to_string(),
            ));
        }
        Ok(Self { storage, point })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Normalized mount point (`/tmp`)
    pub fn point(&self) -> &Path {
        &self.point
    }

    /// Canonical display form with leading and trailing separator (`/tmp/`)
    pub fn point_string(&self) -> String {
        format!("{}/", self.point.display())
    }

    /// Backend path for a normalized logical path, if the path is the mount
    /// point itself or lies below it. Matching is per component, so `/tmp2`
    /// is not inside `/tmp`.
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.point)
            .ok()
            .map(|rel| Path::new("/").join(rel))
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("point", &self.point)
            .field("storage", &self.storage.id())
            .finish()
    }
}

/// Result of resolving a logical path
struct Route<'a> {
    storage: &'a Arc<dyn Storage>,
    mount: Option<&'a Mount>,
    /// Path relative to `storage`
    path: PathBuf,
}

impl Route<'_> {
    /// Map a backend-reported node back into the logical namespace
    fn to_logical(&self, info: NodeInfo) -> NodeInfo {
        match self.mount {
            Some(mount) => {
                let rel = normalize_path(info.path());
                let logical = match rel.strip_prefix("/") {
                    Ok(rel) if !rel.as_os_str().is_empty() => mount.point().join(rel),
                    _ => mount.point().to_path_buf(),
                };
                info.with_path(logical)
            }
            None => {
                let logical = normalize_path(info.path());
                info.with_path(logical)
            }
        }
    }
}

/// Mount-routed composition of storages
///
/// Shared by every request for one tenant; mutations are recorded in the
/// filesystem's event propagator until [`Filesystem::flush_events`].
pub struct Filesystem {
    id: String,
    root: Arc<dyn Storage>,
    mounts: Vec<Mount>,
    events: Arc<EventPropagator>,
}

impl Filesystem {
    pub fn new(id: impl Into<String>, root: Arc<dyn Storage>, mounts: Vec<Mount>) -> Self {
        Self {
            id: id.into(),
            root,
            mounts,
            events: Arc::new(EventPropagator::new()),
        }
    }

    pub fn root(&self) -> &Arc<dyn Storage> {
        &self.root
    }

    /// Mounts in declaration order
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn events(&self) -> &Arc<EventPropagator> {
        &self.events
    }

    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.events.add_event_listener(listener);
    }

    /// Publish buffered events to the listeners. Must be called once per
    /// logical unit of work; unflushed events are never delivered.
    pub fn flush_events(&self) {
        self.events.publish();
    }

    /// Resolve a logical path to its storage and the path within it.
    ///
    /// Mounts are tried in declaration order and the first match wins. A
    /// path outside every mount goes to the root storage unchanged (but
    /// normalized).
    pub fn storage_for_path(&self, path: &Path) -> (Arc<dyn Storage>, PathBuf) {
        let route = self.route(path);
        (route.storage.clone(), route.path)
    }

    fn route(&self, path: &Path) -> Route<'_> {
        let normalized = normalize_path(path);
        for mount in &self.mounts {
            if let Some(rel) = mount.relative(&normalized) {
                trace!("route: {:?} -> mount {} {:?}", path, mount.point_string(), rel);
                return Route {
                    storage: &mount.storage,
                    mount: Some(mount),
                    path: rel,
                };
            }
        }
        trace!("route: {:?} -> root {:?}", path, normalized);
        Route {
            storage: &self.root,
            mount: None,
            path: normalized,
        }
    }

    /// Manual copy from `src` then manual delete of the source. A failed
    /// delete after a successful copy is reported as [`CloudFsError::PartialMove`].
    async fn copy_then_delete(
        &self,
        src: &Route<'_>,
        dst: &Route<'_>,
        src_logical: &Path,
        dst_logical: &Path,
    ) -> Result<()> {
        manual_copy(
            src.storage.as_ref(),
            dst.storage.as_ref(),
            &src.path,
            &dst.path,
        )
        .await?;

        if let Err(cleanup) = manual_delete(src.storage.as_ref(), &src.path).await {
            warn!(
                "move {:?} -> {:?}: copy succeeded but source cleanup failed: {}",
                src_logical, dst_logical, cleanup
            );
            return Err(CloudFsError::PartialMove {
                src: src_logical.display().to_string(),
                dst: dst_logical.display().to_string(),
                cleanup: Box::new(cleanup),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for Filesystem {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn File>> {
        let logical = normalize_path(path);
        if logical == Path::new("/") {
            return Ok(Box::new(RootDir {
                root: self.root.clone(),
                mount_points: self.mounts.iter().map(|m| m.point.clone()).collect(),
            }));
        }

        let route = self.route(&logical);
        let inner = route.storage.open(&route.path).await?;
        Ok(Box::new(EventFile::new(inner, logical, self.events.clone())))
    }

    async fn stat(&self, path: &Path) -> Result<NodeInfo> {
        let route = self.route(path);
        let info = route.storage.stat(&route.path).await?;
        Ok(route.to_logical(info))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let logical = normalize_path(path);
        let route = self.route(&logical);
        manual_delete(route.storage.as_ref(), &route.path).await?;

        debug!("deleted {:?}", logical);
        self.events.add_event(Event::deleted(logical));
        Ok(())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_logical = normalize_path(src);
        let dst_logical = normalize_path(dst);
        let src_route = self.route(&src_logical);
        let dst_route = self.route(&dst_logical);
        check_overlap(
            src_route.storage.as_ref(),
            dst_route.storage.as_ref(),
            &src_route.path,
            &dst_route.path,
        )?;

        if same_storage(src_route.storage, dst_route.storage) {
            match src_route.storage.copy(&src_route.path, &dst_route.path).await {
                Err(e) if e.is_not_supported() => {
                    debug!("native copy unsupported ({}), copying manually", e);
                    manual_copy(
                        src_route.storage.as_ref(),
                        dst_route.storage.as_ref(),
                        &src_route.path,
                        &dst_route.path,
                    )
                    .await?;
                }
                other => other?,
            }
        } else {
            manual_copy(
                src_route.storage.as_ref(),
                dst_route.storage.as_ref(),
                &src_route.path,
                &dst_route.path,
            )
            .await?;
        }

        debug!("copied {:?} -> {:?}", src_logical, dst_logical);
        self.events.add_event(Event::changed(dst_logical));
        Ok(())
    }

    async fn move_to(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_logical = normalize_path(src);
        let dst_logical = normalize_path(dst);
        let src_route = self.route(&src_logical);
        let dst_route = self.route(&dst_logical);
        check_overlap(
            src_route.storage.as_ref(),
            dst_route.storage.as_ref(),
            &src_route.path,
            &dst_route.path,
        )?;

        if same_storage(src_route.storage, dst_route.storage) {
            match src_route
                .storage
                .move_to(&src_route.path, &dst_route.path)
                .await
            {
                Err(e) if e.is_not_supported() => {
                    debug!("native move unsupported ({}), moving manually", e);
                    self.copy_then_delete(&src_route, &dst_route, &src_logical, &dst_logical)
                        .await?;
                }
                other => other?,
            }
        } else {
            self.copy_then_delete(&src_route, &dst_route, &src_logical, &dst_logical)
                .await?;
        }

        debug!("moved {:?} -> {:?}", src_logical, dst_logical);
        self.events.add_event(Event::moved(src_logical, dst_logical));
        Ok(())
    }

    async fn list_dir(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>> {
        let route = self.route(path);
        let infos = route.storage.list_dir(&route.path, recursive).await?;
        Ok(infos.into_iter().map(|i| route.to_logical(i)).collect())
    }

    async fn mkdir(&self, path: &Path) -> Result<NodeInfo> {
        let logical = normalize_path(path);
        let route = self.route(&logical);
        let info = route.storage.mkdir(&route.path).await?;

        self.events.add_event(Event::changed(logical));
        Ok(route.to_logical(info))
    }
}

/// Synthetic handle for `/`: lists the root storage plus one directory per
/// mount point. It has no content.
struct RootDir {
    root: Arc<dyn Storage>,
    mount_points: Vec<PathBuf>,
}

impl RootDir {
    fn unsupported(op: &str) -> CloudFsError {
        CloudFsError::NotSupported(format!("cannot {} the filesystem root", op))
    }
}

#[async_trait]
impl File for RootDir {
    fn path(&self) -> &Path {
        Path::new("/")
    }

    async fn read(&mut self, _max: usize) -> Result<Bytes> {
        Err(Self::unsupported("read"))
    }

    async fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Self::unsupported("write"))
    }

    async fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Self::unsupported("seek"))
    }

    async fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(Self::unsupported("truncate"))
    }

    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>> {
        let mut infos: Vec<NodeInfo> = self
            .root
            .list_dir(Path::new("/"), false)
            .await?
            .into_iter()
            .map(|info| {
                let logical = normalize_path(info.path());
                info.with_path(logical)
            })
            // A mount shadows a same-named root entry
            .filter(|info| !self.mount_points.iter().any(|p| p == info.path()))
            .collect();

        infos.extend(
            self.mount_points
                .iter()
                .map(|point| NodeInfo::directory(point.clone())),
        );
        Ok(infos)
    }

    async fn stat(&self) -> Result<NodeInfo> {
        Ok(NodeInfo::directory("/"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
