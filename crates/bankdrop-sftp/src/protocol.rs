//! SFTP Protocol Implementation
//!
//! Message types, status codes, open flags and attribute records as defined
//! in draft-ietf-secsh-filexfer-02 (SFTP version 3), plus the
//! length-prefixed packet framing used on the `sftp` subsystem channel.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path, not following a final symlink
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::Version),
            3 => Ok(Self::Open),
            4 => Ok(Self::Close),
            5 => Ok(Self::Read),
            6 => Ok(Self::Write),
            7 => Ok(Self::Lstat),
            8 => Ok(Self::Fstat),
            9 => Ok(Self::Setstat),
            10 => Ok(Self::Fsetstat),
            11 => Ok(Self::Opendir),
            12 => Ok(Self::Readdir),
            13 => Ok(Self::Remove),
            14 => Ok(Self::Mkdir),
            15 => Ok(Self::Rmdir),
            16 => Ok(Self::Realpath),
            17 => Ok(Self::Stat),
            18 => Ok(Self::Rename),
            19 => Ok(Self::Readlink),
            20 => Ok(Self::Symlink),
            101 => Ok(Self::Status),
            102 => Ok(Self::Handle),
            103 => Ok(Self::Data),
            104 => Ok(Self::Name),
            105 => Ok(Self::Attrs),
            200 => Ok(Self::Extended),
            201 => Ok(Self::ExtendedReply),
            _ => Err(crate::Error::NotSupported(format!("Unknown message type: {value}"))),
        }
    }
}

/// SFTP status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code as Self
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Eof),
            2 => Ok(Self::NoSuchFile),
            3 => Ok(Self::PermissionDenied),
            4 => Ok(Self::Failure),
            5 => Ok(Self::BadMessage),
            6 => Ok(Self::NoConnection),
            7 => Ok(Self::ConnectionLost),
            8 => Ok(Self::OpUnsupported),
            _ => Err(crate::Error::Protocol(format!("Unknown status code: {value}"))),
        }
    }
}

/// File open flags (`pflags` of SSH_FXP_OPEN)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    pub const fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub const fn has_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub const fn has_append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub const fn has_creat(self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub const fn has_trunc(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub const fn has_excl(self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// File type bits of `st_mode`
pub const S_IFMT: u32 = 0o170_000;
/// Directory
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link
pub const S_IFLNK: u32 = 0o120_000;

/// File attributes (SFTP v3 ATTRS)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;
    const FLAG_EXTENDED: u32 = 0x8000_0000;

    /// Attribute record of a local file
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            Self {
                size: Some(metadata.size()),
                uid: Some(metadata.uid()),
                gid: Some(metadata.gid()),
                permissions: Some(metadata.mode()),
                atime: u32::try_from(metadata.atime()).ok(),
                mtime: u32::try_from(metadata.mtime()).ok(),
            }
        }

        #[cfg(not(unix))]
        {
            let kind = if metadata.is_dir() {
                S_IFDIR | 0o755
            } else if metadata.file_type().is_symlink() {
                S_IFLNK | 0o777
            } else if metadata.permissions().readonly() {
                S_IFREG | 0o444
            } else {
                S_IFREG | 0o644
            };
            let epoch = |t: std::io::Result<std::time::SystemTime>| {
                t.ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .and_then(|d| u32::try_from(d.as_secs()).ok())
            };

            Self {
                size: Some(metadata.len()),
                uid: None,
                gid: None,
                permissions: Some(kind),
                atime: epoch(metadata.accessed()),
                mtime: epoch(metadata.modified()),
            }
        }
    }

    /// True if no attribute is set
    pub const fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.permissions.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Copy of the record with the permission bits removed
    pub fn without_permissions(&self) -> Self {
        Self {
            permissions: None,
            ..self.clone()
        }
    }

    /// True if `permissions` describes a directory
    pub const fn is_dir(&self) -> bool {
        matches!(self.permissions, Some(mode) if mode & S_IFMT == S_IFDIR)
    }

    /// `ls -l` style line used as the NAME entry longname
    pub fn longname(&self, filename: &str) -> String {
        let mode = self.permissions.unwrap_or(0);
        let kind = match mode & S_IFMT {
            S_IFDIR => 'd',
            S_IFLNK => 'l',
            S_IFREG => '-',
            _ => '?',
        };
        let mut perms = String::with_capacity(10);
        perms.push(kind);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }

        let date = self
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
            .map_or_else(
                || "(unknown date)".to_string(),
                |t| {
                    if (Utc::now() - t).num_days().abs() > 180 {
                        t.format("%b %d  %Y").to_string()
                    } else {
                        t.format("%b %d %H:%M").to_string()
                    }
                },
            );

        format!(
            "{perms}   1 {:<8} {:<8} {:>8} {date} {filename}",
            self.uid.unwrap_or(0),
            self.gid.unwrap_or(0),
            self.size.unwrap_or(0),
        )
    }

    /// Encode file attributes to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode file attributes from bytes
    ///
    /// Extended attribute pairs are consumed and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Protocol`] if the record is truncated.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = Self::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }

        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_EXTENDED != 0 {
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                codec::get_bytes(buf)?;
                codec::get_bytes(buf)?;
            }
        }

        Ok(attrs)
    }
}

/// Helper functions for encoding/decoding SFTP protocol fields
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Decode a big-endian u32
    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("Insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    /// Decode a big-endian u64
    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::Error::Protocol("Insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }

    /// Decode an SFTP string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("Invalid UTF-8 string: {e}")))
    }

    /// Encode bytes as SFTP string (length + data)
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("Insufficient data for bytes".into()));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }
}

/// Read one length-prefixed packet (type byte + payload).
///
/// Returns `Ok(None)` on a clean end of stream before a new packet starts.
///
/// # Errors
///
/// Returns [`crate::Error::Protocol`] for an empty or oversized packet and
/// [`crate::Error::Io`] if the stream ends mid-packet.
pub async fn read_packet<R>(reader: &mut R, max_len: u32) -> crate::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(crate::Error::Protocol("Empty packet".into()));
    }
    if len > max_len {
        return Err(crate::Error::Protocol(format!(
            "Packet of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;
    Ok(Some(packet))
}

/// Write one packet with its length prefix and flush it.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the channel rejects the write.
#[allow(clippy::cast_possible_truncation)]
pub async fn write_packet<W>(writer: &mut W, packet: &[u8]) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = BytesMut::with_capacity(packet.len() + 4);
    framed.put_u32(packet.len() as u32);
    framed.put_slice(packet);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Peek at the request id that follows the type byte, if present.
pub fn peek_request_id(packet: &[u8]) -> Option<u32> {
    let mut rest = packet.get(1..)?;
    (rest.remaining() >= 4).then(|| rest.get_u32())
}
