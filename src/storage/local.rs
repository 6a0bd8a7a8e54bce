//! Local disk storage backend
//!
//! Serves a directory tree rooted at the path of a `local:///abs/path`
//! URI. Paths are normalized lexically before being joined onto the root,
//! so `..` can never climb out of it.

use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::{CloudFsError, Result};
use crate::storage::{
    backend_key, guess_mime_type, key_to_path, resolve_seek, synthesize_etag, File, NodeInfo,
    Storage,
};

/// Largest buffer a single read allocates
const MAX_READ_CHUNK: usize = 1024 * 1024;

/// Map filesystem metadata onto [`NodeInfo`]
fn node_info_from_local(path: PathBuf, metadata: &Metadata) -> NodeInfo {
    let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
    if metadata.is_dir() {
        NodeInfo::new(path, 0, mtime, true, "", synthesize_etag(mtime, 0))
    } else {
        let size = metadata.len();
        let mime = guess_mime_type(&path);
        NodeInfo::new(path, size, mtime, false, mime, synthesize_etag(mtime, size))
    }
}

/// Storage backed by a local directory
pub struct LocalStorage {
    id: String,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    /// Build from a `local://` URI. Both `local:///srv/data` and
    /// `local://srv/data` address `/srv/data`.
    pub fn from_url(id: &str, url: &Url) -> Result<Self> {
        let mut location = String::new();
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            location.push('/');
            location.push_str(host);
        }
        location.push_str(url.path());
        if location.is_empty() {
            return Err(CloudFsError::Config(format!(
                "local storage URI has no path: {}",
                url
            )));
        }

        let root = PathBuf::from(location);
        info!("building local storage {} at {:?}", id, root);
        Ok(Self::new(id, root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }

    async fn stat_key(&self, key: &str) -> Result<NodeInfo> {
        let metadata = fs::metadata(self.full_path(key)).await?;
        Ok(node_info_from_local(key_to_path(key), &metadata))
    }

    async fn list_key(&self, key: &str) -> Result<Vec<NodeInfo>> {
        let mut entries = fs::read_dir(self.full_path(key)).await?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let child_key = if key.is_empty() {
                name.to_string_lossy().into_owned()
            } else {
                format!("{}/{}", key, name.to_string_lossy())
            };
            let metadata = entry.metadata().await?;
            infos.push(node_info_from_local(key_to_path(&child_key), &metadata));
        }
        infos.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(infos)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn File>> {
        let key = backend_key(path);
        let full = self.full_path(&key);
        trace!("open: path={:?} full={:?}", path, full);

        if fs::metadata(&full).await.is_err() {
            // Creatable only when the parent directory exists
            let parent = full.parent().unwrap_or(&self.root);
            let parent_meta = fs::metadata(parent).await?;
            if !parent_meta.is_dir() {
                return Err(CloudFsError::NotADirectory(parent.display().to_string()));
            }
        }

        Ok(Box::new(LocalFile {
            path: path.to_path_buf(),
            key,
            full,
            handle: None,
            writable: false,
            offset: 0,
        }))
    }

    async fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.stat_key(&backend_key(path)).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = backend_key(path);
        if key.is_empty() {
            return Err(CloudFsError::InvalidPath(
                "cannot delete storage root".to_string(),
            ));
        }
        let full = self.full_path(&key);
        debug!("delete: {:?}", full);

        let metadata = fs::metadata(&full).await?;
        if metadata.is_dir() {
            let mut entries = fs::read_dir(&full).await?;
            if entries.next_entry().await?.is_some() {
                return Err(CloudFsError::NotEmpty(key_to_path(&key).display().to_string()));
            }
            fs::remove_dir(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_key = backend_key(src);
        let dst_key = backend_key(dst);
        // fs::copy truncates the destination before reading the source
        if src_key == dst_key {
            return Err(CloudFsError::InvalidPath(format!(
                "cannot copy {} onto itself",
                key_to_path(&src_key).display()
            )));
        }
        let src_full = self.full_path(&src_key);
        let dst_full = self.full_path(&dst_key);
        debug!("copy: {:?} -> {:?}", src_full, dst_full);

        if fs::metadata(&src_full).await?.is_dir() {
            return Err(CloudFsError::NotSupported(
                "local storage cannot copy directories natively".to_string(),
            ));
        }
        fs::copy(&src_full, &dst_full).await?;
        Ok(())
    }

    async fn move_to(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_key = backend_key(src);
        let dst_key = backend_key(dst);
        if src_key.is_empty() || dst_key.is_empty() {
            return Err(CloudFsError::InvalidPath(
                "cannot move storage root".to_string(),
            ));
        }
        let src_full = self.full_path(&src_key);
        let dst_full = self.full_path(&dst_key);
        debug!("move: {:?} -> {:?}", src_full, dst_full);

        fs::rename(&src_full, &dst_full).await?;
        Ok(())
    }

    async fn list_dir(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>> {
        let key = backend_key(path);
        trace!("list_dir: key={} recursive={}", key, recursive);

        if !fs::metadata(self.full_path(&key)).await?.is_dir() {
            return Err(CloudFsError::NotADirectory(
                key_to_path(&key).display().to_string(),
            ));
        }

        if !recursive {
            return self.list_key(&key).await;
        }

        let mut infos = Vec::new();
        let mut pending = vec![key];
        while let Some(dir) = pending.pop() {
            for info in self.list_key(&dir).await? {
                if info.is_dir() {
                    pending.push(backend_key(info.path()));
                }
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(infos)
    }

    async fn mkdir(&self, path: &Path) -> Result<NodeInfo> {
        let key = backend_key(path);
        let full = self.full_path(&key);
        debug!("mkdir: {:?}", full);

        fs::create_dir(&full).await?;
        self.stat_key(&key).await
    }
}

/// Handle on a local file. The OS file is opened lazily: read-only for
/// reads, read-write (creating) on the first mutation.
struct LocalFile {
    path: PathBuf,
    key: String,
    full: PathBuf,
    handle: Option<fs::File>,
    writable: bool,
    offset: u64,
}

impl LocalFile {
    async fn handle(&mut self, write: bool) -> Result<&mut fs::File> {
        if self.handle.is_none() || (write && !self.writable) {
            let file = if write {
                fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.full)
                    .await?
            } else {
                let metadata = fs::metadata(&self.full).await?;
                if metadata.is_dir() {
                    return Err(CloudFsError::IsADirectory(self.path.display().to_string()));
                }
                fs::File::open(&self.full).await?
            };
            self.handle = Some(file);
            self.writable = write;
        }
        self.handle
            .as_mut()
            .ok_or_else(|| CloudFsError::Backend("file handle unavailable".to_string()))
    }
}

#[async_trait]
impl File for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let offset = self.offset;
        let file = self.handle(false).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; max.min(MAX_READ_CHUNK)];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        self.offset += n as u64;
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.offset;
        let file = self.handle(true).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match fs::metadata(&self.full).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        self.offset = resolve_seek(self.offset, len, pos)?;
        Ok(self.offset)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        let file = self.handle(true).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>> {
        let mut entries = fs::read_dir(&self.full).await?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let child = key_to_path(&self.key).join(entry.file_name());
            let metadata = entry.metadata().await?;
            infos.push(node_info_from_local(child, &metadata));
        }
        infos.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(infos)
    }

    async fn stat(&self) -> Result<NodeInfo> {
        let metadata = fs::metadata(&self.full).await?;
        Ok(node_info_from_local(key_to_path(&self.key), &metadata))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.handle.take() {
            if self.writable {
                file.flush().await?;
                file.sync_all().await?;
            }
        }
        Ok(())
    }
}
