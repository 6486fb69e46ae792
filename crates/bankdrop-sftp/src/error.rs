//! Error types for the upload server
//!
//! NIST 800-53: SI-11 (Error Handling), AU-3 (Content of Audit Records)
//! Implementation: every failure carries enough context for the local log,
//! while the peer only ever sees a sanitized status message.

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::StatusCode;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
///
/// NIST 800-53: SI-11 (Error Handling)
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error without further context
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem operation failed on a resolved path
    ///
    /// NIST 800-53: SI-11
    /// Implementation: keeps operation, resolved path and cause together so
    /// the log entry for a failed command identifies all three.
    #[error("{operation} failed on {}: {source}", path.display())]
    Fs {
        /// Operation name (open, stat, rename, ...)
        operation: &'static str,
        /// Resolved path under the upload root
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// SSH transport error
    ///
    /// NIST 800-53: SI-11, SC-8 (Transmission Confidentiality)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol violation or malformed packet
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Invalid client-supplied path
    ///
    /// NIST 800-53: SI-10 (Input Validation), SI-11
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation exceeded its time limit
    ///
    /// NIST 800-53: AC-12 (Session Termination)
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Unknown or closed handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Per-session resources depleted
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Unsupported SFTP operation
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Wrap an OS error from a filesystem call on `path`.
    pub fn fs(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Fs {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Create timeout error with context
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }

    /// Create invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Self::InvalidHandle(context.into())
    }

    /// Create resource exhaustion error
    pub fn resource_exhaustion(context: impl Into<String>) -> Self {
        Self::ResourceExhaustion(context.into())
    }

    /// Kind of the underlying OS error, if there is one.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io(e) | Self::Fs { source: e, .. } => Some(e.kind()),
            _ => None,
        }
    }

    /// Check if error was caused by client input
    ///
    /// NIST 800-53: SI-10 (Input Validation), SI-11
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_)
                | Self::InvalidHandle(_)
                | Self::NotSupported(_)
                | Self::Protocol(_)
        ) || matches!(
            self.io_kind(),
            Some(std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied)
        )
    }

    /// Check if error has security implications and should be audited
    ///
    /// NIST 800-53: AU-2 (Audit Events), SI-11
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::InvalidPath(_))
            || self.io_kind() == Some(std::io::ErrorKind::PermissionDenied)
    }

    /// SFTP status code for this error
    ///
    /// Filesystem failures collapse to `Failure` except for the two kinds
    /// every client knows how to present.
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::Io(_) | Self::Fs { .. } => match self.io_kind() {
                Some(std::io::ErrorKind::NotFound) => StatusCode::NoSuchFile,
                Some(std::io::ErrorKind::PermissionDenied) => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            Self::InvalidPath(_) | Self::InvalidHandle(_) | Self::Protocol(_) => {
                StatusCode::BadMessage
            }
            Self::NotSupported(_) => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }

    /// Message safe to send to the peer
    ///
    /// NIST 800-53: SI-11 (Error Handling)
    /// Implementation: never exposes resolved paths or configuration detail
    pub fn sanitized_message(&self) -> String {
        match self.to_status_code() {
            StatusCode::NoSuchFile => "No such file".to_string(),
            StatusCode::PermissionDenied => "Permission denied".to_string(),
            StatusCode::OpUnsupported => "Operation unsupported".to_string(),
            StatusCode::BadMessage => match self {
                Self::InvalidPath(_) => "Invalid path".to_string(),
                Self::InvalidHandle(_) => "Invalid handle".to_string(),
                _ => "Bad message".to_string(),
            },
            _ => match self {
                Self::Config(_) => "Server configuration error".to_string(),
                Self::ResourceExhaustion(_) => "Too many open handles".to_string(),
                Self::Timeout(_) => "Operation timed out".to_string(),
                _ => "Failure".to_string(),
            },
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    fn fs_err(kind: ErrorKind) -> Error {
        Error::fs("open", "/srv/upload/secret.csv", std::io::Error::from(kind))
    }

    #[test]
    fn test_fs_errors_map_to_status() {
        assert_eq!(fs_err(ErrorKind::NotFound).to_status_code(), StatusCode::NoSuchFile);
        assert_eq!(
            fs_err(ErrorKind::PermissionDenied).to_status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(fs_err(ErrorKind::AlreadyExists).to_status_code(), StatusCode::Failure);
    }

    #[test]
    fn test_is_client_error() {
        assert!(Error::InvalidPath("test".into()).is_client_error());
        assert!(fs_err(ErrorKind::NotFound).is_client_error());
        assert!(!Error::Timeout("test".into()).is_client_error());
        assert!(!fs_err(ErrorKind::Other).is_client_error());
    }

    #[test]
    fn test_is_security_event() {
        assert!(Error::InvalidPath("test".into()).is_security_event());
        assert!(fs_err(ErrorKind::PermissionDenied).is_security_event());
        assert!(!fs_err(ErrorKind::NotFound).is_security_event());
    }

    #[test]
    fn test_sanitized_message_hides_paths() {
        let msg = fs_err(ErrorKind::NotFound).sanitized_message();
        assert_eq!(msg, "No such file");
        assert!(!msg.contains("/srv/upload"));

        let config_err = Error::Config("Missing host key at /secure/path".into());
        assert_eq!(config_err.sanitized_message(), "Server configuration error");
    }

    #[test]
    fn test_display_includes_context() {
        let text = fs_err(ErrorKind::NotFound).to_string();
        assert!(text.starts_with("open failed on /srv/upload/secret.csv"));
    }
}
