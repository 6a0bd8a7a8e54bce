//! cloudfs: a mount-routed virtual filesystem over pluggable storage backends
//!
//! Client operations are routed to one of several interchangeable backends
//! (local disk, memory, object store) according to a per-tenant mount table.
//!
//! # Architecture
//!
//! - **Storage**: the backend contract ([`storage::Storage`]) plus the
//!   local, memory and S3 drivers.
//! - **Transfer**: backend-agnostic copy and delete used whenever an
//!   operation crosses backends or a backend lacks a native primitive.
//! - **Filesystem**: the mount router. Resolves each path to one storage
//!   and records change events for successful mutations.
//! - **Events**: deduplicating event buffer, published to listeners on flush.
//! - **Provider**: builds storages and filesystems from specs and caches
//!   them so equal specs share one instance.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use cloudfs::config::Config;
//! use cloudfs::provider::Provider;
//! use cloudfs::storage::Storage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(Path::new("cloudfs.yaml"))?;
//! config.validate()?;
//!
//! let provider = Provider::default();
//! let fs = provider
//!     .provide_filesystem(&config.filesystems[0].to_spec())
//!     .await?;
//!
//! for node in fs.list_dir(Path::new("/"), false).await? {
//!     println!("{}", node.path().display());
//! }
//! fs.flush_events();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod provider;
pub mod spec;
pub mod storage;
pub mod transfer;

pub use error::{CloudFsError, Result};
pub use events::{Event, EventListener};
pub use filesystem::Filesystem;
pub use provider::Provider;
pub use spec::{FileSystemSpec, MountSpec, StorageSpec};
pub use storage::{NodeInfo, Storage};
