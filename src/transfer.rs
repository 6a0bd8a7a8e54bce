//! Backend-agnostic copy and delete
//!
//! Built only on the [`Storage`] contract, so they work between any two
//! backends and for nodes a backend cannot copy natively. Neither
//! algorithm rolls back: a failure part way through leaves whatever was
//! already copied or deleted in place.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::error::{CloudFsError, Result};
use crate::storage::{
    backend_key, is_within, normalize_path, same_instance, write_all, File, NodeInfo, Storage,
};

/// Chunk size used when streaming file contents between backends
pub const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Path of `child` relative to `parent`. Falls back to the last component
/// when the backend reports children under another root form.
fn relative_child_path(parent: &Path, child: &Path) -> PathBuf {
    let parent = normalize_path(parent);
    let child = normalize_path(child);
    match child.strip_prefix(&parent) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => child
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default(),
    }
}

/// Reject a transfer within one storage whose destination is the source
/// itself or lies below it. Such a copy would either truncate the source
/// before reading it or never terminate.
pub fn check_overlap(
    src: &dyn Storage,
    dst: &dyn Storage,
    src_path: &Path,
    dst_path: &Path,
) -> Result<()> {
    if same_instance(src, dst) && is_within(src_path, dst_path) {
        return Err(CloudFsError::InvalidPath(format!(
            "cannot transfer {} into itself ({})",
            normalize_path(src_path).display(),
            normalize_path(dst_path).display()
        )));
    }
    Ok(())
}

/// Copy `src_path` on `src` to `dst_path` on `dst`, recursing into
/// directories (pre-order: a directory is created before its children).
pub fn manual_copy<'a>(
    src: &'a dyn Storage,
    dst: &'a dyn Storage,
    src_path: &'a Path,
    dst_path: &'a Path,
) -> BoxFuture<'a, Result<()>> {
    async move {
        debug!(
            "manual copy: {}:{:?} -> {}:{:?}",
            src.id(),
            src_path,
            dst.id(),
            dst_path
        );
        check_overlap(src, dst, src_path, dst_path)?;
        let info = src.stat(src_path).await?;

        if !info.is_dir() {
            return copy_file(src, dst, src_path, dst_path).await;
        }

        if let Err(e) = dst.mkdir(dst_path).await {
            // Copying onto an existing directory merges into it
            let merge = matches!(e, CloudFsError::AlreadyExists(_))
                && dst.stat(dst_path).await?.is_dir();
            if !merge {
                return Err(e);
            }
        }

        for child in src.list_dir(src_path, false).await? {
            let child_dst = dst_path.join(relative_child_path(src_path, child.path()));
            manual_copy(src, dst, child.path(), &child_dst).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn copy_file(
    src: &dyn Storage,
    dst: &dyn Storage,
    src_path: &Path,
    dst_path: &Path,
) -> Result<()> {
    let mut reader = src.open(src_path).await?;
    let mut writer = dst.open(dst_path).await?;

    let copied = stream(reader.as_mut(), writer.as_mut()).await;
    let closed = writer.close().await;
    reader.close().await?;

    let bytes = copied?;
    closed?;
    trace!("copied {} bytes to {:?}", bytes, dst_path);
    Ok(())
}

async fn stream(reader: &mut dyn File, writer: &mut dyn File) -> Result<u64> {
    // Start from an empty destination so no stale tail survives
    writer.truncate(0).await?;

    let mut total = 0u64;
    loop {
        let chunk = reader.read(COPY_CHUNK_SIZE).await?;
        if chunk.is_empty() {
            return Ok(total);
        }
        write_all(writer, &chunk).await?;
        total += chunk.len() as u64;
    }
}

/// Delete `path` and, for directories, everything below it (post-order:
/// children before their directory). The storage root is never deleted.
pub async fn manual_delete(storage: &dyn Storage, path: &Path) -> Result<()> {
    if backend_key(path).is_empty() {
        return Err(CloudFsError::InvalidPath(
            "cannot delete root of storage".to_string(),
        ));
    }

    let info = storage.stat(path).await?;
    debug!("manual delete: {}:{:?}", storage.id(), path);
    delete_tree(storage, path.to_path_buf(), info.is_dir()).await
}

fn delete_tree(storage: &dyn Storage, path: PathBuf, is_dir: bool) -> BoxFuture<'_, Result<()>> {
    async move {
        if is_dir {
            let children: Vec<NodeInfo> = storage.list_dir(&path, false).await?;
            for child in children {
                delete_tree(storage, child.path().to_path_buf(), child.is_dir()).await?;
            }
        }
        storage.delete(&path).await
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::read_to_end;

    async fn put(storage: &dyn Storage, path: &str, content: &[u8]) {
        let mut file = storage.open(Path::new(path)).await.unwrap();
        file.write(content).await.unwrap();
        file.close().await.unwrap();
    }

    async fn get(storage: &dyn Storage, path: &str) -> Vec<u8> {
        let mut file = storage.open(Path::new(path)).await.unwrap();
        read_to_end(file.as_mut()).await.unwrap()
    }

    #[test]
    fn test_relative_child_path() {
        assert_eq!(
            relative_child_path(Path::new("a"), Path::new("/a/b.txt")),
            PathBuf::from("b.txt")
        );
        assert_eq!(
            relative_child_path(Path::new("/x"), Path::new("/elsewhere/b.txt")),
            PathBuf::from("b.txt")
        );
    }

    #[tokio::test]
    async fn test_copy_tree_between_backends() {
        let src = MemoryStorage::new("src");
        let dir = tempfile::tempdir().unwrap();
        let dst = LocalStorage::new("dst", dir.path());

        src.mkdir(Path::new("/proj")).await.unwrap();
        src.mkdir(Path::new("/proj/src")).await.unwrap();
        src.mkdir(Path::new("/proj/src/deep")).await.unwrap();
        put(&src, "/proj/README", b"readme").await;
        put(&src, "/proj/src/main.rs", b"fn main() {}").await;
        put(&src, "/proj/src/deep/empty", b"").await;

        manual_copy(&src, &dst, Path::new("/proj"), Path::new("/copy"))
            .await
            .unwrap();

        assert_eq!(get(&dst, "/copy/README").await, b"readme");
        assert_eq!(get(&dst, "/copy/src/main.rs").await, b"fn main() {}");
        assert!(dst.stat(Path::new("/copy/src/deep")).await.unwrap().is_dir());
        assert_eq!(dst.stat(Path::new("/copy/src/deep/empty")).await.unwrap().size(), 0);
    }

    #[tokio::test]
    async fn test_copy_overwrites_longer_destination() {
        let src = MemoryStorage::new("src");
        let dst = MemoryStorage::new("dst");
        put(&src, "/f", b"new").await;
        put(&dst, "/f", b"much longer old content").await;

        manual_copy(&src, &dst, Path::new("/f"), Path::new("/f"))
            .await
            .unwrap();
        assert_eq!(get(&dst, "/f").await, b"new");
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let src = MemoryStorage::new("src");
        let dst = MemoryStorage::new("dst");
        let err = manual_copy(&src, &dst, Path::new("/nope"), Path::new("/x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!dst.exists(Path::new("/x")).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_into_own_subtree_rejected() {
        let storage = MemoryStorage::new("mem");
        storage.mkdir(Path::new("/a")).await.unwrap();
        put(&storage, "/a/f", b"data").await;

        for dst in ["/a", "/a/b", "/a/./b/c"] {
            let err = manual_copy(&storage, &storage, Path::new("/a"), Path::new(dst))
                .await
                .unwrap_err();
            assert!(matches!(err, CloudFsError::InvalidPath(_)), "{}", dst);
        }
        let err = manual_copy(&storage, &storage, Path::new("/a/f"), Path::new("a//f"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudFsError::InvalidPath(_)));

        assert_eq!(get(&storage, "/a/f").await, b"data");
        assert_eq!(storage.list_dir(Path::new("/a"), true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_paths_on_distinct_storages_allowed() {
        let src = MemoryStorage::new("src");
        let dst = MemoryStorage::new("dst");
        put(&src, "/f", b"data").await;

        manual_copy(&src, &dst, Path::new("/f"), Path::new("/f"))
            .await
            .unwrap();
        assert_eq!(get(&dst, "/f").await, b"data");
    }

    #[tokio::test]
    async fn test_delete_tree() {
        let storage = MemoryStorage::new("mem");
        storage.mkdir(Path::new("/d")).await.unwrap();
        storage.mkdir(Path::new("/d/e")).await.unwrap();
        put(&storage, "/d/e/f", b"1").await;
        put(&storage, "/d/g", b"2").await;
        put(&storage, "/keep", b"3").await;

        manual_delete(&storage, Path::new("/d")).await.unwrap();
        assert!(!storage.exists(Path::new("/d")).await.unwrap());
        assert!(storage.exists(Path::new("/keep")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_rejects_root() {
        let storage = MemoryStorage::new("mem");
        for root in ["", "/", ".", "//"] {
            let err = manual_delete(&storage, Path::new(root)).await.unwrap_err();
            assert!(matches!(err, CloudFsError::InvalidPath(_)), "{:?}", root);
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let storage = MemoryStorage::new("mem");
        let err = manual_delete(&storage, Path::new("/ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
