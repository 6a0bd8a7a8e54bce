//! S3 storage backend
//!
//! This backend provides access to Amazon S3 or S3-compatible object
//! stores (MinIO, LocalStack, etc.) through `s3://bucket/prefix` URIs.
//!
//! Objects cannot be written at arbitrary offsets, so file handles buffer
//! the whole object on first mutation and upload it on close.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::Object;
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::{CloudFsError, Result};
use crate::storage::{
    backend_key, guess_mime_type, key_to_path, resolve_seek, File, NodeInfo, Storage,
};

/// S3 storage configuration, parsed from the storage URI
///
/// `s3://<bucket>/<prefix>?region=<r>&endpoint=<url>&force_path_style=true`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3StorageConfig {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region
    pub region: Option<String>,

    /// Key prefix for mounting a subpath within the bucket
    pub prefix: Option<String>,

    /// Custom endpoint URL (for S3-compatible stores)
    pub endpoint: Option<String>,

    /// Force path-style addressing (for MinIO, LocalStack, etc.)
    pub force_path_style: bool,
}

impl S3StorageConfig {
    pub fn from_url(url: &Url) -> Result<Self> {
        let bucket = url
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| CloudFsError::Config(format!("S3 URI has no bucket: {}", url)))?
            .to_string();

        let prefix = url.path().trim_matches('/');
        let mut config = Self {
            bucket,
            region: None,
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            endpoint: None,
            force_path_style: false,
        };

        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "region" => config.region = Some(value.into_owned()),
                "endpoint" => config.endpoint = Some(value.into_owned()),
                "force_path_style" => {
                    config.force_path_style = matches!(value.as_ref(), "true" | "1" | "yes")
                }
                other => {
                    return Err(CloudFsError::Config(format!(
                        "unknown S3 URI parameter '{}'",
                        other
                    )))
                }
            }
        }

        Ok(config)
    }
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    dt.and_then(|dt| u64::try_from(dt.secs()).ok())
        .and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs)))
        .unwrap_or(UNIX_EPOCH)
}

/// Map a HeadObject response onto [`NodeInfo`]
fn node_info_from_head(path: PathBuf, head: &HeadObjectOutput) -> NodeInfo {
    NodeInfo::new(
        path,
        head.content_length().unwrap_or(0).max(0) as u64,
        to_system_time(head.last_modified()),
        false,
        head.content_type().unwrap_or_default(),
        head.e_tag().unwrap_or_default(),
    )
}

/// Map a listed object onto [`NodeInfo`]. Listings carry no content type.
fn node_info_from_object(path: PathBuf, obj: &Object) -> NodeInfo {
    let mime = guess_mime_type(&path);
    NodeInfo::new(
        path,
        obj.size().unwrap_or(0).max(0) as u64,
        to_system_time(obj.last_modified()),
        false,
        mime,
        obj.e_tag().unwrap_or_default(),
    )
}

/// S3 key for a storage path below `prefix`
fn object_key(prefix: &str, path: &Path) -> String {
    let key = backend_key(path);

    if key.is_empty() {
        prefix.to_string()
    } else if prefix.is_empty() {
        key
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Storage path for an S3 key below `prefix`. Only whole-component
/// prefixes are stripped: `data2/x` is not below `data`.
fn object_path(prefix: &str, key: &str) -> PathBuf {
    let relative = match key.strip_prefix(prefix) {
        Some(rest) if prefix.is_empty() || rest.is_empty() || rest.starts_with('/') => rest,
        _ => key,
    };
    key_to_path(relative.trim_matches('/'))
}

/// Whether `key` addresses the storage root (the bucket or the prefix)
fn is_root_key(prefix: &str, key: &str) -> bool {
    key.is_empty() || key.trim_end_matches('/') == prefix
}

/// Bucket, prefix and client shared by the storage and its handles
#[derive(Clone)]
struct S3Location {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Location {
    /// Convert a storage path to an S3 key
    fn path_to_key(&self, path: &Path) -> String {
        object_key(&self.prefix, path)
    }

    /// Convert an S3 key to a storage path (removing prefix)
    fn key_to_path(&self, key: &str) -> PathBuf {
        object_path(&self.prefix, key)
    }

    fn dir_prefix(&self, key: &str) -> String {
        if key.is_empty() || key.ends_with('/') {
            key.to_string()
        } else {
            format!("{}/", key)
        }
    }

    async fn head(&self, key: &str) -> Result<Option<HeadObjectOutput>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(CloudFsError::Backend(format!(
                        "S3 HeadObject error: {}",
                        service_error
                    )))
                }
            }
        }
    }

    /// Whether any object lives under `key/`
    async fn is_dir(&self, key: &str) -> Result<bool> {
        let dir_key = self.dir_prefix(key);
        let list_result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&dir_key)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                CloudFsError::Backend(format!(
                    "S3 ListObjectsV2 error for prefix '{}': {:?}",
                    dir_key, service_error
                ))
            })?;

        Ok(list_result.key_count().unwrap_or(0) > 0 || !list_result.common_prefixes().is_empty())
    }

    async fn stat(&self, path: &Path) -> Result<NodeInfo> {
        let key = self.path_to_key(path);
        trace!("stat: path={:?} key={}", path, key);

        // Bucket/prefix root always exists
        if is_root_key(&self.prefix, &key) {
            return Ok(NodeInfo::directory("/"));
        }

        if let Some(head) = self.head(&key).await? {
            return Ok(node_info_from_head(self.key_to_path(&key), &head));
        }

        if self.is_dir(&key).await? {
            return Ok(NodeInfo::directory(self.key_to_path(&key)));
        }

        Err(CloudFsError::NotFound(format!("{:?}", path)))
    }

    async fn list(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>> {
        let prefix = self.dir_prefix(&self.path_to_key(path));
        let mut infos = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);

            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(|e| {
                let service_error = e.into_service_error();
                CloudFsError::Backend(format!(
                    "S3 ListObjectsV2 list_dir error: {:?}",
                    service_error
                ))
            })?;

            for obj in result.contents() {
                let Some(key) = obj.key() else { continue };
                if key == prefix {
                    continue;
                }
                if key.ends_with('/') {
                    // Directory marker, only reachable without delimiter
                    infos.push(NodeInfo::directory(self.key_to_path(key)));
                } else {
                    infos.push(node_info_from_object(self.key_to_path(key), obj));
                }
            }

            for common_prefix in result.common_prefixes() {
                if let Some(p) = common_prefix.prefix() {
                    infos.push(NodeInfo::directory(self.key_to_path(p)));
                }
            }

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        if infos.is_empty() {
            // A missing prefix lists as empty too
            let info = self.stat(path).await?;
            if !info.is_dir() {
                return Err(CloudFsError::NotADirectory(format!("{:?}", path)));
            }
        }

        infos.sort_by(|a, b| a.path().cmp(b.path()));
        infos.dedup_by(|a, b| a.path() == b.path());
        Ok(infos)
    }

    async fn get(&self, key: &str, range: Option<String>) -> Result<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    CloudFsError::NotFound(format!("object not found: {}", key))
                } else {
                    CloudFsError::Backend(format!("S3 GetObject error: {}", service_error))
                }
            })?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| CloudFsError::Backend(format!("S3 read body error: {}", e)))?;

        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));
        if !content_type.is_empty() {
            request = request.content_type(content_type);
        }
        request
            .send()
            .await
            .map_err(|e| CloudFsError::Backend(format!("S3 PutObject error: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| CloudFsError::Backend(format!("S3 DeleteObject error: {}", e)))?;
        Ok(())
    }
}

/// S3 storage for Amazon S3 and S3-compatible object stores
pub struct S3Storage {
    id: String,
    location: S3Location,
}

impl S3Storage {
    /// Create a new S3 storage from configuration
    pub async fn new(id: impl Into<String>, config: S3StorageConfig) -> Result<Self> {
        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }

        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());
        let id = id.into();
        info!("building S3 storage {} for bucket {}", id, config.bucket);

        Ok(Self {
            id,
            location: S3Location {
                client,
                bucket: config.bucket,
                prefix: config.prefix.unwrap_or_default(),
            },
        })
    }

    pub async fn from_url(id: &str, url: &Url) -> Result<Self> {
        Self::new(id, S3StorageConfig::from_url(url)?).await
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn File>> {
        let key = self.location.path_to_key(path);
        trace!("open: path={:?} key={}", path, key);

        Ok(Box::new(S3File {
            path: path.to_path_buf(),
            key,
            location: self.location.clone(),
            offset: 0,
            size: None,
            buffer: None,
            dirty: false,
        }))
    }

    async fn stat(&self, path: &Path) -> Result<NodeInfo> {
        self.location.stat(path).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = self.location.path_to_key(path);
        if backend_key(path).is_empty() {
            return Err(CloudFsError::InvalidPath(
                "cannot delete storage root".to_string(),
            ));
        }
        debug!("delete: path={:?} key={}", path, key);

        let info = self.location.stat(path).await?;
        if !info.is_dir() {
            return self.location.remove(&key).await;
        }

        if !self.location.list(path, false).await?.is_empty() {
            return Err(CloudFsError::NotEmpty(format!("{:?}", path)));
        }
        self.location.remove(&self.location.dir_prefix(&key)).await
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let info = self.location.stat(src).await?;
        if info.is_dir() {
            return Err(CloudFsError::NotSupported(
                "S3 cannot copy prefixes natively".to_string(),
            ));
        }

        let src_key = self.location.path_to_key(src);
        let dst_key = self.location.path_to_key(dst);
        debug!("copy: {} -> {}", src_key, dst_key);

        let copy_source = format!("{}/{}", self.location.bucket, src_key);
        self.location
            .client
            .copy_object()
            .bucket(&self.location.bucket)
            .key(&dst_key)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| CloudFsError::Backend(format!("S3 CopyObject error: {}", e)))?;

        Ok(())
    }

    async fn move_to(&self, _src: &Path, _dst: &Path) -> Result<()> {
        // No native rename; callers synthesize it via copy + delete
        Err(CloudFsError::NotSupported(
            "S3 doesn't support native rename".to_string(),
        ))
    }

    async fn list_dir(&self, path: &Path, recursive: bool) -> Result<Vec<NodeInfo>> {
        trace!("list_dir: path={:?} recursive={}", path, recursive);
        self.location.list(path, recursive).await
    }

    async fn mkdir(&self, path: &Path) -> Result<NodeInfo> {
        if self.location.exists(path).await? {
            return Err(CloudFsError::AlreadyExists(format!("{:?}", path)));
        }

        // Directories in S3 are virtual - a zero-byte object with a trailing
        // slash keeps an empty one visible.
        let key = self.location.dir_prefix(&self.location.path_to_key(path));
        debug!("mkdir: path={:?} key={}", path, key);
        self.location.put(&key, Bytes::new(), "").await?;

        Ok(NodeInfo::new(
            self.location.key_to_path(&key),
            0,
            SystemTime::now(),
            true,
            "",
            "",
        ))
    }
}

impl S3Location {
    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(CloudFsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Handle on one object. Reads are ranged GETs until the first mutation
/// pulls the object into `buffer`.
struct S3File {
    path: PathBuf,
    key: String,
    location: S3Location,
    offset: u64,
    size: Option<u64>,
    buffer: Option<BytesMut>,
    dirty: bool,
}

impl S3File {
    async fn remote_size(&mut self) -> Result<Option<u64>> {
        if self.size.is_none() {
            if let Some(head) = self.location.head(&self.key).await? {
                self.size = Some(head.content_length().unwrap_or(0).max(0) as u64);
            }
        }
        Ok(self.size)
    }

    async fn load(&mut self) -> Result<&mut BytesMut> {
        if self.buffer.is_none() {
            let initial = match self.remote_size().await? {
                Some(_) => BytesMut::from(&self.location.get(&self.key, None).await?[..]),
                None => BytesMut::new(),
            };
            self.buffer = Some(initial);
        }
        self.buffer
            .as_mut()
            .ok_or_else(|| CloudFsError::Backend("object buffer unavailable".to_string()))
    }
}

#[async_trait]
impl File for S3File {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        if let Some(buffer) = &self.buffer {
            let start = (self.offset as usize).min(buffer.len());
            let end = start.saturating_add(max).min(buffer.len());
            self.offset = end as u64;
            return Ok(Bytes::copy_from_slice(&buffer[start..end]));
        }

        let size = self
            .remote_size()
            .await?
            .ok_or_else(|| CloudFsError::NotFound(format!("{:?}", self.path)))?;
        if self.offset >= size || max == 0 {
            return Ok(Bytes::new());
        }

        let last = self.offset.saturating_add(max as u64).min(size) - 1;
        let range = format!("bytes={}-{}", self.offset, last);
        trace!("read: key={} range={}", self.key, range);

        let data = self.location.get(&self.key, Some(range)).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.offset as usize;
        let required_size = offset.checked_add(data.len()).ok_or_else(|| {
            CloudFsError::InvalidArgument(format!("write past end of address space at {}", offset))
        })?;
        let buffer = self.load().await?;

        if buffer.len() < required_size {
            buffer.resize(required_size, 0);
        }
        buffer[offset..required_size].copy_from_slice(data);

        self.offset = required_size as u64;
        self.dirty = true;
        Ok(data.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match &self.buffer {
            Some(buffer) => buffer.len() as u64,
            None => self.remote_size().await?.unwrap_or(0),
        };
        self.offset = resolve_seek(self.offset, len, pos)?;
        Ok(self.offset)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.load().await?.resize(size as usize, 0);
        self.dirty = true;
        Ok(())
    }

    async fn read_dir(&mut self) -> Result<Vec<NodeInfo>> {
        self.location.list(&self.location.key_to_path(&self.key), false).await
    }

    async fn stat(&self) -> Result<NodeInfo> {
        self.location.stat(&self.location.key_to_path(&self.key)).await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let data = match self.buffer.take() {
            Some(buffer) => buffer.freeze(),
            None => Bytes::new(),
        };
        debug!("close: uploading key={} size={}", self.key, data.len());

        let size = data.len() as u64;
        self.location
            .put(&self.key, data.clone(), &guess_mime_type(&self.path))
            .await?;
        self.size = Some(size);
        self.buffer = Some(BytesMut::from(&data[..]));
        self.dirty = false;
        Ok(())
    }
}
