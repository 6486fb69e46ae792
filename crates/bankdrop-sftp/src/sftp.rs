//! SFTP subsystem session
//!
//! NIST 800-53: AC-3 (Access Enforcement), AU-2 (Audit Events), SI-11 (Error Handling)
//! Implementation: decodes SFTP v3 requests from the subsystem channel,
//! dispatches them to a [`FileSystem`] and encodes the replies. Every
//! failure reaches the client as a STATUS with a sanitized message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audit::AuditEvent;
use crate::handles::{DirListing, HandleEntry, HandleRegistry};
use crate::protocol::{
    FileAttrs, MessageType, OpenFlags, SFTP_VERSION, StatusCode, codec, peek_request_id,
    read_packet, write_packet,
};
use crate::vfs::FileSystem;
use crate::{Config, Error, Result};

/// Entries per READDIR reply
pub const READDIR_BATCH: usize = 100;

/// Largest READ served in one reply
pub const MAX_READ_LEN: u32 = 64 * 1024;

/// Upper bound on a single filesystem request
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// One SFTP session bound to an authenticated channel
#[derive(Debug)]
pub struct SftpSession {
    fs: Arc<dyn FileSystem>,
    handles: HandleRegistry,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    max_packet_size: u32,
    version: Option<u32>,
}

impl SftpSession {
    /// New session for `username` connected from `peer_addr`
    pub fn new(
        fs: Arc<dyn FileSystem>,
        config: &Config,
        peer_addr: Option<SocketAddr>,
        username: Option<String>,
    ) -> Self {
        Self {
            fs,
            handles: HandleRegistry::new(config.max_handles_per_session),
            peer_addr,
            username,
            max_packet_size: config.max_packet_size,
            version: None,
        }
    }

    /// Negotiated protocol version, once INIT was received
    pub const fn version(&self) -> Option<u32> {
        self.version
    }

    /// Open handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Serve requests from `stream` until EOF, a fatal protocol error or
    /// `shutdown` fires. Open handles are released on every exit path.
    ///
    /// # Errors
    ///
    /// Returns the protocol or I/O error that ended the session.
    pub async fn run<S>(mut self, mut stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.serve(&mut stream, &shutdown).await;
        let released = self.handles.close_all().await;

        match &result {
            Ok(()) => debug!(released, "SFTP session ended"),
            Err(e) => warn!(error = %e, released, "SFTP session ended with error"),
        }
        result
    }

    async fn serve<S>(&mut self, stream: &mut S, shutdown: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("SFTP session cancelled");
                    return Ok(());
                }
                packet = read_packet(stream, self.max_packet_size) => packet?,
            };

            let Some(packet) = packet else {
                return Ok(());
            };

            let response = self.handle_packet(&packet).await?;
            write_packet(stream, &response).await?;
        }
    }

    /// Handle one packet (type byte onward) and produce the reply.
    ///
    /// # Errors
    ///
    /// Only fatal conditions are returned: a request before INIT or a
    /// packet too short to carry a request id. Everything else is answered
    /// with a STATUS reply.
    pub async fn handle_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let Some((&type_byte, mut buf)) = packet.split_first() else {
            return Err(Error::Protocol("Empty packet".into()));
        };

        if type_byte == MessageType::Init as u8 {
            return self.handle_init(&mut buf);
        }
        if self.version.is_none() {
            return Err(Error::Protocol(format!(
                "Request type {type_byte} before INIT"
            )));
        }

        let request_id = peek_request_id(packet)
            .ok_or_else(|| Error::Protocol("Packet too short for request id".into()))?;
        let mut payload = &buf[4..];

        let result = match MessageType::try_from(type_byte) {
            Ok(msg_type) => {
                trace!(?msg_type, request_id, "SFTP request");
                match timeout(FILE_OP_TIMEOUT, self.dispatch(msg_type, request_id, &mut payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!("{msg_type:?} timed out"))),
                }
            }
            Err(e) => Err(e),
        };

        Ok(result.unwrap_or_else(|e| {
            if e.is_security_event() {
                warn!(
                    event = "security_event",
                    request_id,
                    username = ?self.username,
                    error = %e,
                    "Refused request with security implications"
                );
            } else if e.is_client_error() {
                debug!(request_id, error = %e, "Request refused");
            } else {
                warn!(request_id, error = %e, "Request failed");
            }
            send_status_error(request_id, &e)
        }))
    }

    async fn dispatch(
        &mut self,
        msg_type: MessageType,
        request_id: u32,
        buf: &mut &[u8],
    ) -> Result<Vec<u8>> {
        match msg_type {
            MessageType::Open => self.handle_open(request_id, buf).await,
            MessageType::Close => self.handle_close(request_id, buf).await,
            MessageType::Read => self.handle_read(request_id, buf).await,
            MessageType::Write => self.handle_write(request_id, buf).await,
            MessageType::Lstat => self.handle_lstat(request_id, buf).await,
            MessageType::Fstat => self.handle_fstat(request_id, buf).await,
            MessageType::Setstat => Err(Error::NotSupported("SETSTAT".into())),
            MessageType::Fsetstat => self.handle_fsetstat(request_id, buf),
            MessageType::Opendir => self.handle_opendir(request_id, buf).await,
            MessageType::Readdir => self.handle_readdir(request_id, buf),
            MessageType::Remove => self.handle_remove(request_id, buf).await,
            MessageType::Mkdir => self.handle_mkdir(request_id, buf).await,
            MessageType::Rmdir => self.handle_rmdir(request_id, buf).await,
            MessageType::Realpath => self.handle_realpath(request_id, buf),
            MessageType::Stat => self.handle_stat(request_id, buf).await,
            MessageType::Rename => self.handle_rename(request_id, buf).await,
            other => Err(Error::NotSupported(format!("{other:?}"))),
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let client_version = codec::get_u32(buf)?;
        let version = client_version.min(SFTP_VERSION);
        self.version = Some(version);

        info!(
            event = "sftp_session_started",
            client_version,
            version,
            username = ?self.username,
            "SFTP session initialized"
        );

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Version as u8);
        response.put_u32(version);
        Ok(response.to_vec())
    }

    async fn handle_open(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let attrs = FileAttrs::decode(buf)?;

        let result = self.fs.open(&path, flags, &attrs).await;
        if flags.has_write() || result.is_err() {
            self.audit("OPEN", &path, &result, None);
        }

        let handle = self.handles.insert_file(result?)?;
        Ok(send_handle(request_id, &handle))
    }

    async fn handle_close(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;

        match self.handles.remove(&handle)? {
            HandleEntry::File(file) => {
                let path = file.path().display().to_string();
                let result = file.close().await;
                self.audit_resolved("CLOSE", path, &result, result.as_ref().ok().copied());
                result?;
            }
            HandleEntry::Dir(listing) => {
                trace!(path = %listing.path().display(), "Closed directory handle");
            }
        }

        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_read(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?.min(MAX_READ_LEN);

        let data = self.handles.file_mut(&handle)?.read(offset, len).await?;
        // A zero-length read says nothing about the end of the file.
        if data.is_empty() && len > 0 {
            return Ok(send_status(request_id, StatusCode::Eof, "End of file"));
        }
        Ok(send_data(request_id, &data))
    }

    async fn handle_write(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        self.handles.file_mut(&handle)?.write(offset, &data).await?;
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_stat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let attrs = self.fs.stat(&path).await?;
        Ok(send_attrs(request_id, &attrs))
    }

    async fn handle_lstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let attrs = self.fs.lstat(&path).await?;
        Ok(send_attrs(request_id, &attrs))
    }

    async fn handle_fstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let attrs = self.handles.file_mut(&handle)?.stat().await?;
        Ok(send_attrs(request_id, &attrs))
    }

    fn handle_fsetstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let attrs = FileAttrs::decode(buf)?;

        self.handles.file_mut(&handle)?.set_attrs(&attrs);
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_opendir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let resolved = self.fs.resolve(&path)?;
        let entries = self.fs.list(&path).await?;

        debug!(path = %resolved.display(), entries = entries.len(), "Opened directory");
        let handle = self.handles.insert_dir(DirListing::new(resolved, entries))?;
        Ok(send_handle(request_id, &handle))
    }

    fn handle_readdir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;

        let Some(batch) = self.handles.dir_mut(&handle)?.next_batch(READDIR_BATCH) else {
            return Ok(send_status(request_id, StatusCode::Eof, "End of directory"));
        };

        Ok(send_name(
            request_id,
            batch
                .iter()
                .map(|entry| (entry.name.as_str(), entry.attrs.longname(&entry.name), &entry.attrs)),
        ))
    }

    async fn handle_remove(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let result = self.fs.remove(&path).await;
        self.audit("REMOVE", &path, &result, None);
        result?;
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_mkdir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        let result = self.fs.mkdir(&path, &attrs).await;
        self.audit("MKDIR", &path, &result, None);
        result?;
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_rmdir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let result = self.fs.rmdir(&path).await;
        self.audit("RMDIR", &path, &result, None);
        result?;
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    fn handle_realpath(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let canonical = self.fs.realpath(&path);
        let attrs = FileAttrs::default();
        Ok(send_name(
            request_id,
            std::iter::once((canonical.as_str(), canonical.clone(), &attrs)),
        ))
    }

    async fn handle_rename(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let old_path = codec::get_string(buf)?;
        let new_path = codec::get_string(buf)?;
        let result = self.fs.rename(&old_path, &new_path).await;
        self.audit("RENAME", &old_path, &result, None);
        result?;
        Ok(send_status(request_id, StatusCode::Ok, "Success"))
    }

    fn audit<T>(&self, operation: &str, path: &str, result: &Result<T>, bytes: Option<u64>) {
        let resolved = self
            .fs
            .resolve(path)
            .map_or_else(|_| path.to_string(), |p| p.display().to_string());
        self.audit_resolved(operation, resolved, result, bytes);
    }

    fn audit_resolved<T>(&self, operation: &str, path: String, result: &Result<T>, bytes: Option<u64>) {
        AuditEvent::FileOperation {
            client_ip: self.peer_addr.map(|a| a.ip()),
            username: self.username.clone(),
            operation: operation.to_string(),
            path,
            timestamp: Utc::now(),
            success: result.is_ok(),
            bytes_transferred: bytes,
            error: result.as_ref().err().map(ToString::to_string),
        }
        .log();
    }
}

/// STATUS reply
pub fn send_status(request_id: u32, code: StatusCode, msg: &str) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Status as u8);
    response.put_u32(request_id);
    response.put_u32(code.into());
    codec::put_string(&mut response, msg);
    codec::put_string(&mut response, "en");
    response.to_vec()
}

/// STATUS reply for a failed request
///
/// NIST 800-53: SI-11 (Error Handling)
/// Implementation: code from the error kind, message sanitized
fn send_status_error(request_id: u32, error: &Error) -> Vec<u8> {
    send_status(request_id, error.to_status_code(), &error.sanitized_message())
}

fn send_handle(request_id: u32, handle: &[u8]) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Handle as u8);
    response.put_u32(request_id);
    codec::put_bytes(&mut response, handle);
    response.to_vec()
}

fn send_data(request_id: u32, data: &[u8]) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Data as u8);
    response.put_u32(request_id);
    codec::put_bytes(&mut response, data);
    response.to_vec()
}

fn send_attrs(request_id: u32, attrs: &FileAttrs) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Attrs as u8);
    response.put_u32(request_id);
    response.put(attrs.encode());
    response.to_vec()
}

#[allow(clippy::cast_possible_truncation)]
fn send_name<'a, I>(request_id: u32, entries: I) -> Vec<u8>
where
    I: ExactSizeIterator<Item = (&'a str, String, &'a FileAttrs)>,
{
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Name as u8);
    response.put_u32(request_id);
    response.put_u32(entries.len() as u32);
    for (name, longname, attrs) in entries {
        codec::put_string(&mut response, name);
        codec::put_string(&mut response, &longname);
        response.put(attrs.encode());
    }
    response.to_vec()
}
