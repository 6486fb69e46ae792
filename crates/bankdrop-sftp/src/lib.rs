//! # Bankdrop SFTP
//!
//! SFTP drop server for file-based integrations: clients authenticate with
//! a listed SSH public key and deliver files into a single flat upload
//! directory.
//!
//! This crate implements the protocol as defined in:
//! - RFC 4252: SSH Authentication Protocol (public key only)
//! - RFC 4254: SSH Connection Protocol (`sftp` subsystem)
//! - draft-ietf-secsh-filexfer-02: SSH File Transfer Protocol, version 3
//!
//! ## Features
//!
//! - Async/await with Tokio, one task per connection
//! - Exact-match public key authentication against an authorized keys file
//! - Every client path confined to `root / basename(path)`
//! - Uploads published atomically on close
//! - Structured audit events through `tracing`

pub mod audit;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handles;
pub mod keys;
pub mod protocol;
pub mod server;
pub mod sftp;
pub mod stats;
pub mod vfs;

pub use audit::AuditEvent;
pub use auth::{AuthDecision, AuthState, SessionAuthenticator};
pub use config::{Config, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use keys::{AuthorizedKeySet, load_or_generate_host_key};
pub use server::Server;
pub use sftp::SftpSession;
pub use stats::UploadStats;
pub use vfs::{DirEntry, FileSystem, UploadRootFs};
