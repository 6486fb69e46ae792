//! Configuration for the upload server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest packet limit that still fits a 32 KiB WRITE plus its header.
pub const MIN_PACKET_SIZE: u32 = 34_000;

/// Server configuration, constructed once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port (2222 unprivileged, 22 for a standard SSH deployment)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upload root: every filesystem operation is confined to this directory
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// OpenSSH private host key. A fresh Ed25519 key is generated when unset
    /// or when the file does not exist.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,

    /// Authorized public keys file
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,

    /// How long a connection may take to open its session channel
    #[serde(default = "default_channel_open_timeout")]
    pub channel_open_timeout_secs: u64,

    /// Transport inactivity timeout (0 disables it)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Authentication attempts allowed per connection (NIST 800-53: AC-7)
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,

    /// Largest accepted SFTP packet, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Open file and directory handles allowed per session
    #[serde(default = "default_max_handles")]
    pub max_handles_per_session: usize,

    /// Stage truncating uploads in a hidden file and publish them on close
    #[serde(default = "default_atomic_uploads")]
    pub atomic_uploads: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            root_dir: default_root_dir(),
            host_key_path: None,
            authorized_keys_path: default_authorized_keys_path(),
            channel_open_timeout_secs: default_channel_open_timeout(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
            max_packet_size: default_max_packet_size(),
            max_handles_per_session: default_max_handles(),
            atomic_uploads: default_atomic_uploads(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] on malformed TOML.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// A missing root is allowed here; the binary creates it before serving.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> crate::Result<()> {
        if self.root_dir.exists() && !self.root_dir.is_dir() {
            return Err(crate::Error::Config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }

        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(crate::Error::Config(format!(
                "max_packet_size must be at least {MIN_PACKET_SIZE} bytes"
            )));
        }

        if self.channel_open_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "channel_open_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.max_handles_per_session == 0 {
            return Err(crate::Error::Config(
                "max_handles_per_session must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Bounded wait for the peer's session channel
    pub const fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_open_timeout_secs)
    }

    /// Transport inactivity timeout, `None` when disabled
    pub const fn inactivity_timeout(&self) -> Option<Duration> {
        if self.inactivity_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.inactivity_timeout_secs))
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    2222 // Non-privileged port
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("upload")
}

fn default_authorized_keys_path() -> PathBuf {
    PathBuf::from("authorized_keys/client.pub")
}

const fn default_channel_open_timeout() -> u64 {
    60
}

const fn default_inactivity_timeout() -> u64 {
    600 // 10 minutes
}

const fn default_max_auth_attempts() -> usize {
    6
}

const fn default_max_packet_size() -> u32 {
    262_144 // 256 KiB
}

const fn default_max_handles() -> usize {
    1024
}

const fn default_atomic_uploads() -> bool {
    true
}
