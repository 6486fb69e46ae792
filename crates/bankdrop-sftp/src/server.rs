//! SFTP server
//!
//! Accepts TCP connections and serves each one on its own task. The SSH
//! transport is configured for public-key authentication only.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::connection::{ConnectionContext, handle_connection};
use crate::keys::{AuthorizedKeySet, load_or_generate_host_key};
use crate::vfs::{FileSystem, UploadRootFs};
use crate::{Config, Error, Result};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SFTP Server
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    context: ConnectionContext,
}

impl Server {
    /// Bind a server from configuration.
    ///
    /// Creates the upload root if needed, loads the authorized keys (a
    /// missing file is logged and rejects every client) and loads or
    /// generates the host key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration or an unreadable
    /// host key, and [`Error::Io`] if the root cannot be created or the
    /// address cannot be bound.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| Error::fs("create_root", &config.root_dir, e))?;

        let keys = AuthorizedKeySet::load(&config.authorized_keys_path);
        let host_key = load_or_generate_host_key(config.host_key_path.as_deref())?;
        let fs: Arc<dyn FileSystem> = Arc::new(UploadRootFs::from_config(&config));

        Self::with_parts(config, keys, host_key, fs).await
    }

    /// Bind a server from already-loaded parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn with_parts(
        config: Config,
        keys: AuthorizedKeySet,
        host_key: PrivateKey,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let ssh_config = ssh_config(&config, host_key);

        info!(
            event = "server_bound",
            addr = %listener.local_addr()?,
            authorized_keys = keys.len(),
            "SFTP server listening"
        );

        Ok(Self {
            listener,
            context: ConnectionContext {
                config: Arc::new(config),
                ssh_config: Arc::new(ssh_config),
                keys: Arc::new(keys),
                fs,
            },
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Propagates the OS error from `getsockname`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; accept errors are logged and
    /// the loop continues.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Connections already being served keep running on their own tasks.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for fatal listener errors.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(event = "server_stopping", "Stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        let context = self.context.clone();
                        tokio::spawn(handle_connection(stream, Some(peer_addr), context));
                    }
                    Err(e) => {
                        error!(event = "accept_failed", error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }
}

/// SSH transport configuration: public key only, host key, timeouts.
///
/// NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
pub fn ssh_config(config: &Config, host_key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        inactivity_timeout: config.inactivity_timeout(),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: config.max_auth_attempts,
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keys: vec![host_key],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::Algorithm;

    #[test]
    fn test_ssh_config_is_publickey_only() {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let config = Config {
            max_auth_attempts: 3,
            ..Config::default()
        };

        let ssh = ssh_config(&config, key);
        assert_eq!(ssh.max_auth_attempts, 3);
        assert_eq!(ssh.keys.len(), 1);
        assert_eq!(ssh.inactivity_timeout, Some(Duration::from_secs(600)));
    }
}
