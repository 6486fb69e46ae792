//! Virtual filesystem confined to the upload root
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
//! Implementation: every client path is flattened to `root / basename(path)`
//! before it reaches the OS, so no request can address anything outside the
//! root. Hierarchy supplied by clients is discarded; the root is a flat drop
//! directory read by the reporting side.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handles::{Access, FileHandle, OpenMode};
use crate::protocol::{FileAttrs, OpenFlags};
use crate::{Config, Error, Result};

/// Prefix of in-flight upload files
pub const STAGING_PREFIX: &str = ".bankdrop-";
/// Suffix of in-flight upload files
pub const STAGING_SUFFIX: &str = ".part";

/// Default creation mode when the client sends no permissions
#[cfg(unix)]
const DEFAULT_CREATE_MODE: u32 = 0o666;

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (leaf only)
    pub name: String,
    /// Attributes of the entry
    pub attrs: FileAttrs,
}

/// Filesystem operations the SFTP layer dispatches to.
///
/// Every method takes the raw client path and resolves it itself; a
/// failure is always reported as `Err`, never as a partial success.
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Absolute path a client path maps to
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for paths that cannot be confined.
    fn resolve(&self, path: &str) -> Result<PathBuf>;

    /// Entries of a directory; a missing directory lists as empty
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Attributes, following a final symlink
    async fn stat(&self, path: &str) -> Result<FileAttrs>;

    /// Attributes, not following a final symlink
    async fn lstat(&self, path: &str) -> Result<FileAttrs>;

    /// Open a file according to SFTP `pflags`
    async fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttrs) -> Result<FileHandle>;

    /// Unlink a file
    async fn remove(&self, path: &str) -> Result<()>;

    /// Rename a file or directory, replacing an existing target
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Create a directory
    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> Result<()>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Canonical absolute form of a client path, without touching disk
    fn realpath(&self, path: &str) -> String {
        normalize_virtual(path)
    }
}

/// Map a client path onto `root / basename(path)`.
///
/// Both `/` and `\` separate components. An empty, `.` or `..` leaf maps to
/// the root itself. Staging names are private to the server.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] for NUL bytes, staging names, or a leaf
/// that is not a single plain component on this platform.
pub fn resolve(root: &Path, virtual_path: &str) -> Result<PathBuf> {
    if virtual_path.contains('\0') {
        return Err(Error::InvalidPath("Path contains null byte".into()));
    }

    let leaf = virtual_path.rsplit(['/', '\\']).next().unwrap_or_default();
    match leaf {
        "" | "." | ".." => Ok(root.to_path_buf()),
        name if is_staging_name(name) => {
            Err(Error::InvalidPath(format!("Reserved name: {name}")))
        }
        name => {
            let mut components = Path::new(name).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => Ok(root.join(name)),
                _ => Err(Error::InvalidPath(format!("Unsupported path: {name}"))),
            }
        }
    }
}

/// Normalize a client path to an absolute `/`-rooted form.
///
/// Relative paths are taken relative to `/`; `..` never climbs above it.
pub fn normalize_virtual(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// True for names used by in-flight uploads
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

/// The single [`FileSystem`] implementation: a flat upload root on local disk.
#[derive(Debug, Clone)]
pub struct UploadRootFs {
    root: PathBuf,
    atomic_uploads: bool,
}

impl UploadRootFs {
    /// Filesystem rooted at `root`.
    ///
    /// With `atomic_uploads`, truncating write-only opens go to a hidden
    /// staging file that CLOSE renames onto the target.
    pub fn new(root: impl Into<PathBuf>, atomic_uploads: bool) -> Self {
        Self {
            root: root.into(),
            atomic_uploads,
        }
    }

    /// Filesystem for the configured root
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.root_dir.clone(), config.atomic_uploads)
    }

    /// The confinement root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(format!(
            "{STAGING_PREFIX}{}{STAGING_SUFFIX}",
            Uuid::new_v4().simple()
        ))
    }

    /// Check an existing upload target before staging over it.
    ///
    /// The target must be writable in place, the same as an in-place
    /// truncating open would require; a directory fails here. Returns the
    /// mode and ownership the published file should carry over, or `None`
    /// when there is no target yet.
    async fn existing_upload_target(target: &Path) -> Result<Option<FileAttrs>> {
        let metadata = match fs::metadata(target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(failed("open", target, e)),
        };

        if metadata.is_dir() {
            return Err(failed(
                "open",
                target,
                std::io::Error::from(std::io::ErrorKind::IsADirectory),
            ));
        }

        fs::OpenOptions::new()
            .write(true)
            .open(target)
            .await
            .map_err(|e| failed("open", target, e))?;

        let current = FileAttrs::from_metadata(&metadata);
        Ok(Some(FileAttrs {
            uid: current.uid,
            gid: current.gid,
            permissions: current.permissions,
            ..FileAttrs::default()
        }))
    }

    /// Apply attributes after creation. Failures are logged, never returned.
    ///
    /// Returns `true` if every requested attribute was applied.
    async fn apply_attrs(&self, operation: &'static str, path: &Path, attrs: &FileAttrs) -> bool {
        let mut complete = true;

        #[cfg(unix)]
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;

            let perms = std::fs::Permissions::from_mode(mode & 0o7777);
            if let Err(e) = fs::set_permissions(path, perms).await {
                log_attr_failure(operation, path, "permissions", &e);
                complete = false;
            }
        }

        #[cfg(unix)]
        if attrs.uid.is_some() || attrs.gid.is_some() {
            // Only succeeds with privileges; expected to fail otherwise.
            if let Err(e) = std::os::unix::fs::chown(path, attrs.uid, attrs.gid) {
                log_attr_failure(operation, path, "ownership", &e);
                complete = false;
            }
        }

        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let to_time =
                |secs: u32| std::time::UNIX_EPOCH + std::time::Duration::from_secs(u64::from(secs));
            let mut times = std::fs::FileTimes::new();
            if let Some(atime) = attrs.atime {
                times = times.set_accessed(to_time(atime));
            }
            if let Some(mtime) = attrs.mtime {
                times = times.set_modified(to_time(mtime));
            }
            let result = std::fs::File::open(path).and_then(|f| f.set_times(times));
            if let Err(e) = result {
                log_attr_failure(operation, path, "times", &e);
                complete = false;
            }
        }

        if let Some(size) = attrs.size {
            let result = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|f| f.set_len(size));
            if let Err(e) = result {
                log_attr_failure(operation, path, "size", &e);
                complete = false;
            }
        }

        complete
    }
}

/// Log a failed filesystem call and wrap it with its context.
fn failed(operation: &'static str, path: &Path, source: std::io::Error) -> Error {
    warn!(
        event = "fs_operation_failed",
        operation,
        path = %path.display(),
        cause = %source,
        "Filesystem operation failed"
    );
    Error::fs(operation, path, source)
}

fn log_attr_failure(operation: &'static str, path: &Path, attribute: &'static str, e: &std::io::Error) {
    warn!(
        event = "attr_apply_failed",
        operation,
        attribute,
        path = %path.display(),
        cause = %e,
        "Could not apply requested attribute"
    );
}

#[async_trait]
impl FileSystem for UploadRootFs {
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        resolve(&self.root, path)
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(path)?;

        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %dir.display(), "Listing missing directory as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(failed("list", &dir, e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| failed("list", &dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_staging_name(&name) {
                continue;
            }

            let entry_path = entry.path();
            // A dangling symlink still lists, with its own attributes.
            let metadata = match fs::metadata(&entry_path).await {
                Ok(metadata) => metadata,
                Err(_) => fs::symlink_metadata(&entry_path)
                    .await
                    .map_err(|e| failed("list", &entry_path, e))?,
            };

            entries.push(DirEntry {
                name,
                attrs: FileAttrs::from_metadata(&metadata),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileAttrs> {
        let resolved = self.resolve(path)?;
        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| failed("stat", &resolved, e))?;
        Ok(FileAttrs::from_metadata(&metadata))
    }

    async fn lstat(&self, path: &str) -> Result<FileAttrs> {
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| failed("lstat", &resolved, e))?;
        Ok(FileAttrs::from_metadata(&metadata))
    }

    async fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttrs) -> Result<FileHandle> {
        let target = self.resolve(path)?;
        let mode = OpenMode::from_flags(flags);
        let staging = (self.atomic_uploads && mode.is_upload()).then(|| self.staging_path());
        let carried = match staging {
            Some(_) => Self::existing_upload_target(&target).await?,
            None => None,
        };
        let open_path = staging.clone().unwrap_or_else(|| target.clone());

        let mut options = fs::OpenOptions::new();
        // std refuses create/truncate without write access; the handle keeps
        // its requested access and refuses writes itself.
        let needs_write = mode.access != Access::Read || mode.create || mode.truncate;
        options
            .read(mode.access != Access::Write)
            .write(needs_write && !mode.append)
            .append(mode.append);

        if staging.is_some() {
            options.create_new(true);
        } else {
            options
                .create(mode.create)
                .create_new(mode.create && mode.exclusive)
                .truncate(mode.truncate && !mode.append);
        }

        #[cfg(unix)]
        options.mode(attrs.permissions.map_or(DEFAULT_CREATE_MODE, |p| p & 0o7777));

        let file = options
            .open(&open_path)
            .await
            .map_err(|e| failed("open", &target, e))?;

        if let Some(mut carried) = carried {
            if attrs.permissions.is_some() {
                carried.permissions = None;
            }
            self.apply_attrs("open", &open_path, &carried).await;
        }

        if mode.create && !attrs.is_empty() {
            self.apply_attrs("open", &open_path, &attrs.without_permissions())
                .await;
        }

        debug!(
            path = %target.display(),
            ?mode,
            staged = staging.is_some(),
            "Opened file"
        );

        Ok(FileHandle::new(target, staging, mode, file))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::remove_file(&resolved)
            .await
            .map_err(|e| failed("remove", &resolved, e))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let from = self.resolve(old_path)?;
        let to = self.resolve(new_path)?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| failed("rename", &from, e))
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::create_dir(&resolved)
            .await
            .map_err(|e| failed("mkdir", &resolved, e))?;

        if !attrs.is_empty() {
            self.apply_attrs("mkdir", &resolved, attrs).await;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::remove_dir(&resolved)
            .await
            .map_err(|e| failed("rmdir", &resolved, e))
    }
}
