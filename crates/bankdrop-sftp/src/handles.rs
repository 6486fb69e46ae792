//! Open file and directory handles
//!
//! NIST 800-53: SC-4 (Information in Shared Resources), SC-5 (Denial of Service Protection)
//! Implementation: handles are opaque 4-byte ids scoped to one session and
//! capped per session; staged uploads that never close are discarded.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::protocol::{FileAttrs, OpenFlags};
use crate::vfs::DirEntry;
use crate::{Error, Result};

/// Requested access of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

/// Decoded SFTP open flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Read/write access
    pub access: Access,
    /// Writes go to the end of the file
    pub append: bool,
    /// Create if missing
    pub create: bool,
    /// Truncate an existing file
    pub truncate: bool,
    /// Fail if the file exists (with `create`)
    pub exclusive: bool,
}

impl OpenMode {
    /// Decode `pflags`. Neither READ nor WRITE means read.
    pub const fn from_flags(flags: OpenFlags) -> Self {
        let access = match (flags.has_read(), flags.has_write()) {
            (true, true) => Access::ReadWrite,
            (false, true) => Access::Write,
            _ => Access::Read,
        };
        Self {
            access,
            append: flags.has_append(),
            create: flags.has_creat(),
            truncate: flags.has_trunc(),
            exclusive: flags.has_excl(),
        }
    }

    /// A whole-file upload: writable, create and truncate, not append or exclusive.
    pub fn is_upload(&self) -> bool {
        self.access != Access::Read
            && self.create
            && self.truncate
            && !self.append
            && !self.exclusive
    }

    /// Whether reads are permitted
    pub fn can_read(&self) -> bool {
        self.access != Access::Write
    }

    /// Whether writes are permitted
    pub fn can_write(&self) -> bool {
        self.access != Access::Read
    }
}

/// An open file
///
/// When `staging` is set, data lands in a hidden file that [`close`](Self::close)
/// renames onto `path`. Dropping the handle without closing removes it.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    staging: Option<PathBuf>,
    mode: OpenMode,
    file: File,
    bytes_read: u64,
    bytes_written: u64,
}

impl FileHandle {
    pub(crate) fn new(path: PathBuf, staging: Option<PathBuf>, mode: OpenMode, file: File) -> Self {
        Self {
            path,
            staging,
            mode,
            file,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Resolved target path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the file was opened with
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// True while data is going to a staging file
    pub const fn is_staged(&self) -> bool {
        self.staging.is_some()
    }

    /// Bytes moved through this handle so far, in either direction
    pub const fn bytes_transferred(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }

    fn disk_path(&self) -> &Path {
        self.staging.as_deref().unwrap_or(&self.path)
    }

    /// Read up to `len` bytes at `offset`. An empty result means end of file.
    ///
    /// # Errors
    ///
    /// Returns a permission error for write-only handles and the I/O error otherwise.
    pub async fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if !self.mode.can_read() {
            return Err(self.denied("read"));
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::fs("read", &self.path, e))?;

        let mut data = Vec::with_capacity(len as usize);
        (&mut self.file)
            .take(u64::from(len))
            .read_to_end(&mut data)
            .await
            .map_err(|e| Error::fs("read", &self.path, e))?;

        self.bytes_read += data.len() as u64;
        Ok(data)
    }

    /// Write `data` at `offset` (ignored in append mode) and flush.
    ///
    /// # Errors
    ///
    /// Returns a permission error for read-only handles and the I/O error otherwise.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.mode.can_write() {
            return Err(self.denied("write"));
        }

        if !self.mode.append {
            self.file
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| Error::fs("write", &self.path, e))?;
        }
        self.file
            .write_all(data)
            .await
            .map_err(|e| Error::fs("write", &self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| Error::fs("write", &self.path, e))?;

        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Live attributes of the open file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from `fstat`.
    pub async fn stat(&mut self) -> Result<FileAttrs> {
        let metadata = self
            .file
            .metadata()
            .await
            .map_err(|e| Error::fs("fstat", &self.path, e))?;
        Ok(FileAttrs::from_metadata(&metadata))
    }

    /// Accept attributes on an open handle without applying them.
    pub fn set_attrs(&self, attrs: &FileAttrs) {
        debug!(path = %self.path.display(), ?attrs, "Ignoring attributes set on open handle");
    }

    /// Flush and release the file, publishing a staged upload.
    ///
    /// Returns the bytes transferred through the handle.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from flush or rename. A staged file that could
    /// not be published is removed.
    pub async fn close(mut self) -> Result<u64> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::fs("close", &self.path, e))?;

        if let Some(staging) = self.staging.take() {
            if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
                warn!(
                    event = "upload_publish_failed",
                    path = %self.path.display(),
                    cause = %e,
                    "Could not publish staged upload"
                );
                remove_staging(&staging);
                return Err(Error::fs("close", &self.path, e));
            }
            debug!(path = %self.path.display(), bytes = self.bytes_written, "Published upload");
        }

        Ok(self.bytes_transferred())
    }

    /// Release the file; a staged upload is discarded instead of published.
    pub fn abort(mut self) -> u64 {
        if let Some(staging) = self.staging.take() {
            debug!(path = %self.path.display(), "Discarding unfinished upload");
            remove_staging(&staging);
        }
        self.bytes_transferred()
    }

    fn denied(&self, operation: &'static str) -> Error {
        Error::fs(
            operation,
            self.disk_path(),
            std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("handle not opened for {operation}"),
            ),
        )
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            remove_staging(&staging);
        }
    }
}

fn remove_staging(staging: &Path) {
    match std::fs::remove_file(staging) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => warn!(
            event = "staging_cleanup_failed",
            path = %staging.display(),
            cause = %e,
            "Could not remove staging file"
        ),
        _ => {}
    }
}

/// Snapshot of a directory being read through a handle
#[derive(Debug)]
pub struct DirListing {
    path: PathBuf,
    entries: Vec<DirEntry>,
    position: usize,
}

impl DirListing {
    /// Listing over `entries`, read from `path`
    pub fn new(path: PathBuf, entries: Vec<DirEntry>) -> Self {
        Self {
            path,
            entries,
            position: 0,
        }
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next batch of at most `max` entries, or `None` once exhausted.
    pub fn next_batch(&mut self, max: usize) -> Option<&[DirEntry]> {
        if self.position >= self.entries.len() {
            return None;
        }
        let start = self.position;
        self.position = (start + max.max(1)).min(self.entries.len());
        Some(&self.entries[start..self.position])
    }
}

/// What a handle id refers to
#[derive(Debug)]
pub enum HandleEntry {
    /// Open file
    File(FileHandle),
    /// Open directory
    Dir(DirListing),
}

/// Per-session handle table
#[derive(Debug)]
pub struct HandleRegistry {
    entries: HashMap<u32, HandleEntry>,
    next_id: u32,
    max_handles: usize,
}

impl HandleRegistry {
    /// Empty table admitting at most `max_handles` open handles
    pub fn new(max_handles: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            max_handles,
        }
    }

    /// Register a file and return its wire handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhaustion`] when the table is full; the file
    /// is released (and a staged upload discarded).
    pub fn insert_file(&mut self, handle: FileHandle) -> Result<Vec<u8>> {
        self.insert(HandleEntry::File(handle))
    }

    /// Register a directory listing and return its wire handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhaustion`] when the table is full.
    pub fn insert_dir(&mut self, listing: DirListing) -> Result<Vec<u8>> {
        self.insert(HandleEntry::Dir(listing))
    }

    fn insert(&mut self, entry: HandleEntry) -> Result<Vec<u8>> {
        if self.entries.len() >= self.max_handles {
            return Err(Error::resource_exhaustion(format!(
                "Handle limit of {} reached",
                self.max_handles
            )));
        }

        while self.entries.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id, entry);
        Ok(id.to_be_bytes().to_vec())
    }

    /// Open file behind `handle`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for unknown ids and directory handles.
    pub fn file_mut(&mut self, handle: &[u8]) -> Result<&mut FileHandle> {
        match self.entries.get_mut(&decode_id(handle)?) {
            Some(HandleEntry::File(file)) => Ok(file),
            Some(HandleEntry::Dir(_)) => Err(Error::invalid_handle("Handle refers to a directory")),
            None => Err(Error::invalid_handle("Unknown handle")),
        }
    }

    /// Directory listing behind `handle`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for unknown ids and file handles.
    pub fn dir_mut(&mut self, handle: &[u8]) -> Result<&mut DirListing> {
        match self.entries.get_mut(&decode_id(handle)?) {
            Some(HandleEntry::Dir(listing)) => Ok(listing),
            Some(HandleEntry::File(_)) => Err(Error::invalid_handle("Handle refers to a file")),
            None => Err(Error::invalid_handle("Unknown handle")),
        }
    }

    /// Remove `handle` from the table
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for unknown ids.
    pub fn remove(&mut self, handle: &[u8]) -> Result<HandleEntry> {
        self.entries
            .remove(&decode_id(handle)?)
            .ok_or_else(|| Error::invalid_handle("Unknown handle"))
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no handle is open
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every handle at session end. Unfinished staged uploads are
    /// discarded; in-place files keep what was written.
    ///
    /// Returns how many handles were open.
    pub async fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            if let HandleEntry::File(handle) = entry {
                if handle.is_staged() {
                    handle.abort();
                } else if let Err(e) = handle.close().await {
                    warn!(error = %e, "Failed to close file at session end");
                }
            }
        }
        if count > 0 {
            debug!(count, "Released handles at session end");
        }
        count
    }
}

fn decode_id(handle: &[u8]) -> Result<u32> {
    <[u8; 4]>::try_from(handle)
        .map(u32::from_be_bytes)
        .map_err(|_| Error::invalid_handle(format!("Malformed handle of {} bytes", handle.len())))
}
