//! Per-connection SSH handling
//!
//! NIST 800-53: AC-12 (Session Termination), IA-2 (Identification and Authentication)
//! Implementation: drives one SSH transport, decides authentication through
//! [`SessionAuthenticator`], starts an [`SftpSession`] on the `sftp`
//! subsystem and disconnects peers that never open a channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::auth::{AuthDecision, SessionAuthenticator};
use crate::keys::AuthorizedKeySet;
use crate::sftp::SftpSession;
use crate::vfs::FileSystem;
use crate::{Config, Error, Result};

/// State shared by every connection of one server
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Server configuration
    pub config: Arc<Config>,
    /// SSH transport configuration (host key, auth methods, timeouts)
    pub ssh_config: Arc<russh::server::Config>,
    /// Accepted client keys
    pub keys: Arc<AuthorizedKeySet>,
    /// Filesystem SFTP requests operate on
    pub fs: Arc<dyn FileSystem>,
}

/// russh handler for one connection
struct ConnectionHandler {
    context: ConnectionContext,
    auth: SessionAuthenticator,
    peer_addr: Option<SocketAddr>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    channel_opened: Option<oneshot::Sender<()>>,
    shutdown: CancellationToken,
    username: Arc<OnceLock<String>>,
}

impl ConnectionHandler {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        self.auth.offer_other_method(user, "none");
        Ok(Self::reject())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth> {
        self.auth.offer_other_method(user, "password");
        Ok(Self::reject())
    }

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        // Unlisted keys are refused (and recorded) before the client signs anything.
        let key_b64 = public_key.public_key_base64();
        if self.context.keys.is_authorized(&key_b64) {
            return Ok(Auth::Accept);
        }
        debug!(user, algorithm = %public_key.algorithm(), "Offered key not listed");
        self.auth.offer_public_key(user, &key_b64);
        Ok(Self::reject())
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        match self.auth.offer_public_key(user, &public_key.public_key_base64()) {
            AuthDecision::Accept => {
                let _ = self.username.set(user.to_string());
                Ok(Auth::Accept)
            }
            AuthDecision::Reject => Ok(Self::reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if !self.auth.is_authenticated() {
            warn!(peer = ?self.peer_addr, "Channel open before authentication");
            return Ok(false);
        }

        debug!(peer = ?self.peer_addr, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        if let Some(opened) = self.channel_opened.take() {
            let _ = opened.send(());
        }
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            warn!(subsystem = name, "Rejected subsystem request");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(channel = ?channel_id, "Subsystem request on unknown channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;

        let sftp = SftpSession::new(
            Arc::clone(&self.context.fs),
            &self.context.config,
            self.peer_addr,
            self.auth.username().map(str::to_string),
        );
        let shutdown = self.shutdown.child_token();

        tokio::spawn(async move {
            if let Err(e) = sftp.run(channel.into_stream(), shutdown).await {
                debug!(error = %e, "SFTP subsystem finished with error");
            }
        });
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Serve one accepted connection to completion.
///
/// The peer has `channel_open_timeout` from connect to open a session
/// channel, or it is disconnected. Everything the connection started is
/// cancelled exactly once when this returns.
pub async fn handle_connection<S>(stream: S, peer_addr: Option<SocketAddr>, context: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Utc::now();
    let client_ip = peer_addr.map(|a| a.ip());
    AuditEvent::ConnectionEstablished {
        client_ip,
        timestamp: started,
    }
    .log();

    let shutdown = CancellationToken::new();
    let _release = shutdown.clone().drop_guard();
    let username = Arc::new(OnceLock::new());
    let (opened_tx, opened_rx) = oneshot::channel();

    let handler = ConnectionHandler {
        auth: SessionAuthenticator::new(Arc::clone(&context.keys), peer_addr),
        context: context.clone(),
        peer_addr,
        channels: HashMap::new(),
        channel_opened: Some(opened_tx),
        shutdown: shutdown.clone(),
        username: Arc::clone(&username),
    };

    let reason = match russh::server::run_stream(Arc::clone(&context.ssh_config), stream, handler).await {
        Ok(session) => {
            let handle = session.handle();
            tokio::pin!(session);

            let mut timed_out = false;
            let finished = tokio::select! {
                result = &mut session => Some(result),
                opened = timeout(context.config.channel_open_timeout(), opened_rx) => {
                    if opened.is_err() {
                        timed_out = true;
                        warn!(
                            event = "channel_open_timeout",
                            client_ip = ?client_ip,
                            "No channel opened in time, disconnecting"
                        );
                        if let Err(e) = handle
                            .disconnect(
                                Disconnect::ByApplication,
                                "Channel open timeout".into(),
                                "en".into(),
                            )
                            .await
                        {
                            debug!(error = ?e, "Disconnect after channel timeout failed");
                        }
                    }
                    None
                }
            };

            let result = match finished {
                Some(result) => result,
                None => session.await,
            };
            match result {
                Ok(()) if timed_out => "channel open timeout".to_string(),
                Ok(()) => "client disconnected".to_string(),
                Err(e) => {
                    debug!(error = %e, "SSH session ended with error");
                    e.sanitized_message()
                }
            }
        }
        Err(e) => {
            warn!(client_ip = ?client_ip, error = %e, "SSH handshake failed");
            "handshake failed".to_string()
        }
    };

    let ended = Utc::now();
    AuditEvent::ConnectionClosed {
        client_ip,
        username: username.get().cloned(),
        timestamp: ended,
        duration_secs: (ended - started).num_seconds(),
        reason,
    }
    .log();
    info!(client_ip = ?client_ip, "Connection released");
}
