use std::io;
use thiserror::Error;

/// Main error type for cloudfs operations
#[derive(Error, Debug)]
pub enum CloudFsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend lacks the capability (copy, move, mkdir, ...) for this node.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown storage scheme: {0}")]
    UnknownScheme(String),

    /// Cross-backend move copied the data but could not remove the source.
    /// Both `src` and `dst` now hold the content.
    #[error("Move of {src} to {dst} copied the data but failed to remove the source: {cleanup}")]
    PartialMove {
        src: String,
        dst: String,
        cleanup: Box<CloudFsError>,
    },
}

impl From<io::Error> for CloudFsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => CloudFsError::NotFound(e.to_string()),
            io::ErrorKind::PermissionDenied => CloudFsError::PermissionDenied(e.to_string()),
            io::ErrorKind::AlreadyExists => CloudFsError::AlreadyExists(e.to_string()),
            _ => CloudFsError::Io(e),
        }
    }
}

impl CloudFsError {
    /// Stable not-found signal for protocol adaptation
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudFsError::NotFound(_))
    }

    /// Whether the error reports a missing backend capability
    pub fn is_not_supported(&self) -> bool {
        matches!(self, CloudFsError::NotSupported(_))
    }

    /// Convert error to the HTTP status a WebDAV front end should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            CloudFsError::NotFound(_) => 404,
            CloudFsError::AlreadyExists(_) => 405,
            CloudFsError::NotADirectory(_) => 409,
            CloudFsError::IsADirectory(_) => 405,
            CloudFsError::NotEmpty(_) => 409,
            CloudFsError::InvalidPath(_) => 400,
            CloudFsError::InvalidArgument(_) => 400,
            CloudFsError::NotSupported(_) => 501,
            CloudFsError::PermissionDenied(_) => 403,
            CloudFsError::Io(_) => 500,
            CloudFsError::Backend(_) => 502,
            CloudFsError::Config(_) => 500,
            CloudFsError::UnknownScheme(_) => 500,
            CloudFsError::PartialMove { .. } => 500,
        }
    }
}

/// Result type alias for cloudfs operations
pub type Result<T> = std::result::Result<T, CloudFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: CloudFsError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), 404);

        let err: CloudFsError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, CloudFsError::PermissionDenied(_)));

        let err: CloudFsError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, CloudFsError::Io(_)));
    }

    #[test]
    fn test_partial_move_names_both_sides() {
        let err = CloudFsError::PartialMove {
            src: "/a/x.txt".to_string(),
            dst: "/tmp/x.txt".to_string(),
            cleanup: Box::new(CloudFsError::PermissionDenied("/a/x.txt".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("/a/x.txt"));
        assert!(msg.contains("/tmp/x.txt"));
        assert!(msg.contains("copied"));
        assert!(msg.contains("Permission denied"));
    }
}
