//! Storage backend contract
//!
//! Every backend kind (local disk, memory, object store) implements
//! [`Storage`]. Paths handed to a backend are backend-relative; drivers
//! strip leading separators before touching the underlying store, so
//! `/`, `` and `.` all address the backend root.

pub mod local;
pub mod memory;
pub mod s3;

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CloudFsError, Result};

/// Metadata snapshot for one path
///
/// Always produced from a live backend stat or listing; never cached on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    path: PathBuf,
    size: u64,
    mod_time: SystemTime,
    is_dir: bool,
    mime_type: String,
    etag: String,
}

impl NodeInfo {
    pub fn new(
        path: impl Into<PathBuf>,
        size: u64,
        mod_time: SystemTime,
        is_dir: bool,
        mime_type: impl Into<String>,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            size,
            mod_time,
            is_dir,
            mime_type: mime_type.into(),
            etag: etag.into(),
        }
    }

    /// Directory entry with zero-valued size, time, type and tag
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::new(path, 0, UNIX_EPOCH, true, "", "")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path component, or `/` for the root
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Same metadata reported under another path
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

/// Open handle on a file or directory
///
/// Each handle has its own offset. Reads and writes happen at that offset
/// and advance it.
#[async_trait]
pub trait File: Send + Sync {
    /// Path the handle was opened with
    fn path(&self) -> &Path;

    /// Read up to `max` bytes. Returns an empty buffer at end of file.
    async fn read(&mut self, max: usize) -> Result<Bytes>;

    /// Write `data` at the current offset, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Move the offset
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Resize the file, zero-filling when growing
    async fn truncate(&mut self, size: u64) -> Result<()>;

    /// Non-recursive listing when the handle refers to a directory
    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>>;

    async fn stat(&self) -> Result<NodeInfo>;

    /// Release the handle. Buffered backends persist their data here.
    async fn close(&mut self) -> Result<()>;
}

/// Backend capability contract
///
/// A backend that cannot perform `copy`, `move_to` or `mkdir` for a given
/// node returns [`CloudFsError::NotSupported`]; callers fall back to the
/// generic algorithms in [`crate::transfer`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Identifier from the storage spec
    fn id(&self) -> &str;

    async fn open(&self, path: &Path) -> Result<Box<dyn File>>;

    async fn stat(&self, path: &Path) -> Result<NodeInfo>;

    /// Check if a path exists
    ///
    /// Default implementation uses stat()
    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(CloudFsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete exactly one entry. Directories must be empty; the backend
    /// root can never be deleted.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Same-backend copy
    async fn copy(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Same-backend move
    async fn move_to(&self, src: &Path, dst: &Path) -> Result<()>;

    /// List a directory. Recursive listing is optional; backends without it
    /// return `NotSupported`.
    async fn list_dir(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>>;

    async fn mkdir(&self, path: &Path) -> Result<NodeInfo>;
}

/// Whether two handles point at the same storage instance
pub fn same_storage(a: &Arc<dyn Storage>, b: &Arc<dyn Storage>) -> bool {
    same_instance(a.as_ref(), b.as_ref())
}

/// Whether two storage references are the same object
pub fn same_instance(a: &dyn Storage, b: &dyn Storage) -> bool {
    std::ptr::eq(
        a as *const dyn Storage as *const (),
        b as *const dyn Storage as *const (),
    )
}

/// Whether `path` is `ancestor` or lies below it, compared per component
/// after normalization
pub fn is_within(ancestor: &Path, path: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(ancestor))
}

/// Lexically normalize a path to absolute form.
///
/// `.` is dropped, `..` pops a component (never above `/`) and repeated
/// separators collapse.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    normalized
}

/// Backend key for a path: normalized, without the leading separator.
/// The empty key is the backend root.
pub fn backend_key(path: &Path) -> String {
    let normalized = normalize_path(path);
    normalized
        .to_string_lossy()
        .trim_start_matches('/')
        .to_string()
}

/// Absolute backend path for a key
pub(crate) fn key_to_path(key: &str) -> PathBuf {
    PathBuf::from(format!("/{}", key.trim_start_matches('/')))
}

/// Parent key of a non-root key ("" for top-level entries)
pub(crate) fn parent_key(key: &str) -> &str {
    key.rfind('/').map(|i| &key[..i]).unwrap_or("")
}

/// Content type guessed from the file extension, or empty
pub(crate) fn guess_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or_default()
        .to_string()
}

/// Entity tag for backends that do not store one
pub(crate) fn synthesize_etag(mod_time: SystemTime, size: u64) -> String {
    let nanos = mod_time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", nanos, size)
}

/// Resolve a seek request against the current offset and file length
pub(crate) fn resolve_seek(offset: u64, len: u64, pos: SeekFrom) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(delta) => offset.checked_add_signed(delta),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        CloudFsError::InvalidArgument(format!("seek before start of file: {:?}", pos))
    })
}

/// Read a whole file through a handle
pub async fn read_to_end(file: &mut dyn File) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let chunk = file.read(64 * 1024).await?;
        if chunk.is_empty() {
            return Ok(data);
        }
        data.extend_from_slice(&chunk);
    }
}

/// Write all of `data` through a handle
pub async fn write_all(file: &mut dyn File, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let written = file.write(data).await?;
        if written == 0 {
            return Err(CloudFsError::Backend(format!(
                "short write to {:?}",
                file.path()
            )));
        }
        data = &data[written..];
    }
    Ok(())
}
