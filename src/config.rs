//! Configuration parsing and structures

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::env::substitute_env_vars;
use crate::error::CloudFsError;
use crate::spec::{FileSystemSpec, MountSpec, StorageSpec};
use crate::storage::normalize_path;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named storages (name -> URI) that filesystems may refer to
    #[serde(default)]
    pub storages: HashMap<String, String>,

    /// One entry per tenant filesystem
    pub filesystems: Vec<RawFileSystemConfig>,
}

/// Raw filesystem configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawFileSystemConfig {
    /// Storage backing everything outside the mounts
    pub root: StorageRef,

    /// Mounts, in match order
    #[serde(default)]
    pub mounts: Vec<RawMountConfig>,
}

/// Raw mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Logical path the storage is grafted at
    pub mount_point: PathBuf,

    pub storage: StorageRef,
}

/// A storage given inline or by name from the top-level `storages` table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StorageRef {
    Named(String),
    Inline(StorageSpec),
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Filesystems (storage references resolved)
    pub filesystems: Vec<FileSystemConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error, `cloudfs=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Filesystem configuration (resolved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemConfig {
    pub root: StorageSpec,
    pub mounts: Vec<MountSpec>,
}

impl FileSystemConfig {
    /// Provider key for this filesystem, without a listener
    pub fn to_spec(&self) -> FileSystemSpec {
        FileSystemSpec {
            root: self.root.clone(),
            mounts: self.mounts.clone(),
            listener: None,
        }
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by replacing storage names with
    /// their definitions
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            storages,
            filesystems,
        } = self;

        let mut resolved = Vec::with_capacity(filesystems.len());
        for raw in filesystems {
            resolved.push(Self::resolve_filesystem(&storages, raw)?);
        }

        Ok(Config {
            logging,
            filesystems: resolved,
        })
    }

    fn resolve_filesystem(
        storages: &HashMap<String, String>,
        raw: RawFileSystemConfig,
    ) -> Result<FileSystemConfig, ConfigError> {
        let root = Self::resolve_storage(storages, raw.root)?;

        let mounts = raw
            .mounts
            .into_iter()
            .map(|mount| {
                let storage = Self::resolve_storage(storages, mount.storage)?;
                Ok(MountSpec::new(mount.mount_point, storage))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(FileSystemConfig { root, mounts })
    }

    fn resolve_storage(
        storages: &HashMap<String, String>,
        storage: StorageRef,
    ) -> Result<StorageSpec, ConfigError> {
        match storage {
            StorageRef::Inline(spec) => Ok(spec),
            StorageRef::Named(name) => storages
                .get(&name)
                .map(|uri| StorageSpec::new(name.clone(), uri.clone()))
                .ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "Storage {:?} is not defined in the storages section",
                        name
                    ))
                }),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string after `${VAR}` substitution
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filesystems.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one filesystem is required".to_string(),
            ));
        }

        for fs in &self.filesystems {
            validate_storage(&fs.root, &fs.root.id)?;

            let mut seen: Vec<PathBuf> = Vec::with_capacity(fs.mounts.len());
            for mount in &fs.mounts {
                validate_storage(&mount.storage, &fs.root.id)?;

                let point = normalize_path(&mount.mount_point);
                if point == Path::new("/") {
                    return Err(ConfigError::ValidationError(format!(
                        "Filesystem {:?}: cannot mount {:?} at /",
                        fs.root.id, mount.storage.id
                    )));
                }

                // First match wins, so an earlier ancestor would hide this mount
                for earlier in &seen {
                    if *earlier == point {
                        return Err(ConfigError::ValidationError(format!(
                            "Filesystem {:?}: duplicate mount point {:?}",
                            fs.root.id, point
                        )));
                    }
                    if point.starts_with(earlier) {
                        return Err(ConfigError::ValidationError(format!(
                            "Filesystem {:?}: mount point {:?} is shadowed by earlier mount {:?}",
                            fs.root.id, point, earlier
                        )));
                    }
                }
                seen.push(point);
            }
        }

        Ok(())
    }
}

fn validate_storage(storage: &StorageSpec, filesystem: &str) -> Result<(), ConfigError> {
    if storage.id.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Filesystem {:?}: storage id cannot be empty",
            filesystem
        )));
    }
    if storage.uri.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Filesystem {:?}: storage {:?} has an empty uri",
            filesystem, storage.id
        )));
    }
    Ok(())
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ConfigError::Logging(format!("{:?}: {}", config.level, e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

impl From<ConfigError> for CloudFsError {
    fn from(err: ConfigError) -> Self {
        CloudFsError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inline_storages() {
        let yaml = r#"
logging:
  level: debug

filesystems:
  - root: { id: alice, uri: "local:///srv/alice" }
    mounts:
      - mount_point: /tmp
        storage: { id: scratch, uri: "memory://scratch" }
      - mount_point: /archive
        storage:
          id: archive
          uri: "s3://bucket/alice?region=eu-west-1"
"#;

        let config = Config::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.filesystems.len(), 1);

        let fs = &config.filesystems[0];
        assert_eq!(fs.root, StorageSpec::new("alice", "local:///srv/alice"));
        assert_eq!(fs.mounts.len(), 2);
        assert_eq!(fs.mounts[0].mount_point, PathBuf::from("/tmp"));
        assert_eq!(fs.mounts[1].storage.id, "archive");
    }

    #[test]
    fn test_named_storages_resolved() {
        let yaml = r#"
storages:
  scratch: "memory://scratch"
  shared: "local:///srv/shared"

filesystems:
  - root: { id: alice, uri: "local:///srv/alice" }
    mounts:
      - mount_point: /tmp
        storage: scratch
      - mount_point: /shared
        storage: shared
  - root: { id: bob, uri: "local:///srv/bob" }
    mounts:
      - mount_point: /shared
        storage: shared
"#;

        let config = Config::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "info");

        let alice = &config.filesystems[0];
        assert_eq!(
            alice.mounts[0].storage,
            StorageSpec::new("scratch", "memory://scratch")
        );
        // The same name resolves to equal specs, so the provider shares the instance
        assert_eq!(
            alice.mounts[1].storage,
            config.filesystems[1].mounts[0].storage
        );
    }

    #[test]
    fn test_undefined_storage_name() {
        let yaml = r#"
filesystems:
  - root: nowhere
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("nowhere"), "{}", err);
    }

    #[test]
    fn test_env_substitution_before_parse() {
        std::env::set_var("CLOUDFS_TEST_BUCKET", "tenant-bucket");
        let yaml = r#"
filesystems:
  - root: { id: alice, uri: "s3://${CLOUDFS_TEST_BUCKET}/alice" }
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.filesystems[0].root.uri, "s3://tenant-bucket/alice");
        std::env::remove_var("CLOUDFS_TEST_BUCKET");
    }

    #[test]
    fn test_validate_empty_filesystems() {
        let config = Config {
            logging: LoggingConfig::default(),
            filesystems: vec![],
        };

        assert!(config.validate().is_err());
    }

    fn single(mounts: &[&str]) -> Config {
        let fs = FileSystemConfig {
            root: StorageSpec::new("root", "memory://root"),
            mounts: mounts
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    MountSpec::new(*p, StorageSpec::new(format!("m{}", i), "memory://m"))
                })
                .collect(),
        };
        Config {
            logging: LoggingConfig::default(),
            filesystems: vec![fs],
        }
    }

    #[test]
    fn test_validate_mount_points() {
        assert!(single(&["/tmp", "/tmp2", "/data/deep", "/data"]).validate().is_ok());

        let err = single(&["/"]).validate().unwrap_err();
        assert!(err.to_string().contains("at /"), "{}", err);

        let err = single(&["/tmp", "/tmp/"]).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{}", err);

        let err = single(&["/data", "/data/deep"]).validate().unwrap_err();
        assert!(err.to_string().contains("shadowed"), "{}", err);
    }

    #[test]
    fn test_validate_empty_uri() {
        let mut config = single(&[]);
        config.filesystems[0].root.uri = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_spec() {
        let config = single(&["/tmp"]);
        let spec = config.filesystems[0].to_spec();
        assert_eq!(spec.root.id, "root");
        assert_eq!(spec.mounts.len(), 1);
        assert!(spec.listener.is_none());
    }
}
