//! In-memory storage backend
//!
//! Nodes live in an ordered map keyed by backend key, so a directory's
//! subtree is a contiguous key range. Contents are lost when the last
//! handle to the storage is dropped.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::error::{CloudFsError, Result};
use crate::storage::{
    backend_key, guess_mime_type, key_to_path, parent_key, resolve_seek, synthesize_etag, File,
    NodeInfo, Storage,
};

#[derive(Debug, Clone)]
enum MemoryNode {
    File { data: Bytes, mtime: SystemTime },
    Directory { mtime: SystemTime },
}

type NodeMap = Arc<RwLock<BTreeMap<String, MemoryNode>>>;

/// Map a memory node onto [`NodeInfo`]
fn node_info_from_memory(key: &str, node: &MemoryNode) -> NodeInfo {
    let path = key_to_path(key);
    match node {
        MemoryNode::File { data, mtime } => {
            let size = data.len() as u64;
            let mime = guess_mime_type(&path);
            NodeInfo::new(path, size, *mtime, false, mime, synthesize_etag(*mtime, size))
        }
        MemoryNode::Directory { mtime } => {
            NodeInfo::new(path, 0, *mtime, true, "", synthesize_etag(*mtime, 0))
        }
    }
}

/// Whether `key` lies strictly below `dir` ("" is the root)
fn is_descendant(key: &str, dir: &str) -> bool {
    if dir.is_empty() {
        !key.is_empty()
    } else {
        key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
    }
}

fn is_child(key: &str, dir: &str) -> bool {
    is_descendant(key, dir) && parent_key(key) == dir
}

fn check_dir(nodes: &BTreeMap<String, MemoryNode>, key: &str) -> Result<()> {
    if key.is_empty() {
        return Ok(());
    }
    match nodes.get(key) {
        Some(MemoryNode::Directory { .. }) => Ok(()),
        Some(MemoryNode::File { .. }) => Err(CloudFsError::NotADirectory(key_display(key))),
        None => Err(CloudFsError::NotFound(key_display(key))),
    }
}

fn key_display(key: &str) -> String {
    key_to_path(key).display().to_string()
}

/// Volatile storage backend (`memory://<name>`)
pub struct MemoryStorage {
    id: String,
    nodes: NodeMap,
}

impl MemoryStorage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Build from a `memory://` URI. The host part only names the instance.
    pub fn from_url(id: &str, url: &Url) -> Result<Self> {
        debug!(
            "building memory storage {} ({})",
            id,
            url.host_str().unwrap_or("anonymous")
        );
        Ok(Self::new(id))
    }

    fn stat_key(&self, key: &str) -> Result<NodeInfo> {
        if key.is_empty() {
            return Ok(NodeInfo::directory("/"));
        }
        let nodes = self.nodes.read();
        nodes
            .get(key)
            .map(|node| node_info_from_memory(key, node))
            .ok_or_else(|| CloudFsError::NotFound(key_display(key)))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn File>> {
        let key = backend_key(path);
        trace!("open: path={:?} key={}", path, key);

        if !key.is_empty() {
            let nodes = self.nodes.read();
            if !nodes.contains_key(&key) {
                check_dir(&nodes, parent_key(&key))?;
            }
        }

        Ok(Box::new(MemoryFile {
            path: path.to_path_buf(),
            key,
            nodes: self.nodes.clone(),
            offset: 0,
        }))
    }

    async fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.stat_key(&backend_key(path))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = backend_key(path);
        if key.is_empty() {
            return Err(CloudFsError::InvalidPath(
                "cannot delete storage root".to_string(),
            ));
        }
        debug!("delete: key={}", key);

        let mut nodes = self.nodes.write();
        match nodes.get(&key) {
            None => return Err(CloudFsError::NotFound(key_display(&key))),
            Some(MemoryNode::Directory { .. }) => {
                if nodes.keys().any(|k| is_descendant(k, &key)) {
                    return Err(CloudFsError::NotEmpty(key_display(&key)));
                }
            }
            Some(MemoryNode::File { .. }) => {}
        }
        nodes.remove(&key);
        Ok(())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_key = backend_key(src);
        let dst_key = backend_key(dst);
        debug!("copy: {} -> {}", src_key, dst_key);

        let mut nodes = self.nodes.write();
        let data = match nodes.get(&src_key) {
            Some(MemoryNode::File { data, .. }) => data.clone(),
            Some(MemoryNode::Directory { .. }) => {
                return Err(CloudFsError::NotSupported(
                    "memory storage cannot copy directories natively".to_string(),
                ))
            }
            None if src_key.is_empty() => {
                return Err(CloudFsError::NotSupported(
                    "memory storage cannot copy its root".to_string(),
                ))
            }
            None => return Err(CloudFsError::NotFound(key_display(&src_key))),
        };
        if dst_key.is_empty() {
            return Err(CloudFsError::InvalidPath("cannot overwrite storage root".to_string()));
        }
        check_dir(&nodes, parent_key(&dst_key))?;
        if let Some(MemoryNode::Directory { .. }) = nodes.get(&dst_key) {
            return Err(CloudFsError::IsADirectory(key_display(&dst_key)));
        }

        nodes.insert(
            dst_key,
            MemoryNode::File {
                data,
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn move_to(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_key = backend_key(src);
        let dst_key = backend_key(dst);
        debug!("move: {} -> {}", src_key, dst_key);

        if src_key.is_empty() || dst_key.is_empty() {
            return Err(CloudFsError::InvalidPath(
                "cannot move storage root".to_string(),
            ));
        }
        if src_key == dst_key {
            return Ok(());
        }
        if is_descendant(&dst_key, &src_key) {
            return Err(CloudFsError::InvalidPath(format!(
                "cannot move {} into itself",
                key_display(&src_key)
            )));
        }

        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&src_key) {
            return Err(CloudFsError::NotFound(key_display(&src_key)));
        }
        check_dir(&nodes, parent_key(&dst_key))?;
        if let Some(MemoryNode::Directory { .. }) = nodes.get(&dst_key) {
            return Err(CloudFsError::AlreadyExists(key_display(&dst_key)));
        }

        // Re-key the node and its whole subtree
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == src_key || is_descendant(k, &src_key))
            .cloned()
            .collect();
        for old_key in moved {
            if let Some(node) = nodes.remove(&old_key) {
                let new_key = format!("{}{}", dst_key, &old_key[src_key.len()..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn list_dir(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>> {
        let key = backend_key(path);
        trace!("list_dir: key={} recursive={}", key, recursive);

        let nodes = self.nodes.read();
        check_dir(&nodes, &key)?;

        Ok(nodes
            .iter()
            .filter(|(k, _)| {
                if recursive {
                    is_descendant(k, &key)
                } else {
                    is_child(k, &key)
                }
            })
            .map(|(k, node)| node_info_from_memory(k, node))
            .collect())
    }

    async fn mkdir(&self, path: &Path) -> Result<NodeInfo> {
        let key = backend_key(path);
        debug!("mkdir: key={}", key);

        if key.is_empty() {
            return Err(CloudFsError::AlreadyExists("/".to_string()));
        }

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&key) {
            return Err(CloudFsError::AlreadyExists(key_display(&key)));
        }
        check_dir(&nodes, parent_key(&key))?;

        let node = MemoryNode::Directory {
            mtime: SystemTime::now(),
        };
        let info = node_info_from_memory(&key, &node);
        nodes.insert(key, node);
        Ok(info)
    }
}

/// Handle on a memory node
struct MemoryFile {
    path: PathBuf,
    key: String,
    nodes: NodeMap,
    offset: u64,
}

impl MemoryFile {
    /// Replace the file contents through `f`, creating the file if needed
    fn update(&self, f: impl FnOnce(&mut BytesMut)) -> Result<()> {
        if self.key.is_empty() {
            return Err(CloudFsError::IsADirectory("/".to_string()));
        }
        let mut nodes = self.nodes.write();
        let mut buffer = match nodes.get(&self.key) {
            Some(MemoryNode::File { data, .. }) => BytesMut::from(&data[..]),
            Some(MemoryNode::Directory { .. }) => {
                return Err(CloudFsError::IsADirectory(key_display(&self.key)))
            }
            None => {
                // The parent may have been removed since open
                check_dir(&nodes, parent_key(&self.key))?;
                BytesMut::new()
            }
        };
        f(&mut buffer);
        nodes.insert(
            self.key.clone(),
            MemoryNode::File {
                data: buffer.freeze(),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn contents(&self) -> Result<Bytes> {
        let nodes = self.nodes.read();
        match nodes.get(&self.key) {
            Some(MemoryNode::File { data, .. }) => Ok(data.clone()),
            Some(MemoryNode::Directory { .. }) => {
                Err(CloudFsError::IsADirectory(key_display(&self.key)))
            }
            None if self.key.is_empty() => Err(CloudFsError::IsADirectory("/".to_string())),
            None => Err(CloudFsError::NotFound(key_display(&self.key))),
        }
    }
}

#[async_trait]
impl File for MemoryFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let data = self.contents()?;
        let start = self.offset as usize;
        if start >= data.len() {
            return Ok(Bytes::new());
        }
        let end = start.saturating_add(max).min(data.len());
        self.offset = end as u64;
        Ok(data.slice(start..end))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.offset as usize;
        let required_size = offset.checked_add(data.len()).ok_or_else(|| {
            CloudFsError::InvalidArgument(format!("write past end of address space at {}", offset))
        })?;
        self.update(|buffer| {
            if buffer.len() < required_size {
                buffer.resize(required_size, 0);
            }
            buffer[offset..required_size].copy_from_slice(data);
        })?;
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match self.contents() {
            Ok(data) => data.len() as u64,
            Err(CloudFsError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        self.offset = resolve_seek(self.offset, len, pos)?;
        Ok(self.offset)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.update(|buffer| buffer.resize(size as usize, 0))
    }

    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>> {
        let nodes = self.nodes.read();
        check_dir(&nodes, &self.key)?;
        Ok(nodes
            .iter()
            .filter(|(k, _)| is_child(k, &self.key))
            .map(|(k, node)| node_info_from_memory(k, node))
            .collect())
    }

    async fn stat(&self) -> Result<NodeInfo> {
        if self.key.is_empty() {
            return Ok(NodeInfo::directory("/"));
        }
        let nodes = self.nodes.read();
        nodes
            .get(&self.key)
            .map(|node| node_info_from_memory(&self.key, node))
            .ok_or_else(|| CloudFsError::NotFound(key_display(&self.key)))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
