//! Upload root statistics
//!
//! Snapshot of what clients have delivered, printed by `--stats`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivered file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadStats {
    /// Upload root was readable
    Running {
        /// When the snapshot was taken
        timestamp: DateTime<Utc>,
        /// Absolute upload root
        upload_directory: String,
        /// Number of regular files
        total_files: usize,
        /// Sum of their sizes
        total_size_bytes: u64,
        /// Files sorted by name
        files: Vec<FileStat>,
    },
    /// Upload root could not be read
    Error {
        /// When the snapshot was taken
        timestamp: DateTime<Utc>,
        /// What went wrong
        error: String,
    },
}

impl UploadStats {
    /// Scan `root`. Hidden entries (including in-flight uploads) and
    /// anything that is not a regular file are left out.
    pub fn collect(root: &Path) -> Self {
        let timestamp = Utc::now();
        match scan(root) {
            Ok((upload_directory, files)) => Self::Running {
                timestamp,
                upload_directory,
                total_files: files.len(),
                total_size_bytes: files.iter().map(|f| f.size).sum(),
                files,
            },
            Err(e) => Self::Error {
                timestamp,
                error: format!("{}: {e}", root.display()),
            },
        }
    }

    /// Pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn scan(root: &Path) -> std::io::Result<(String, Vec<FileStat>)> {
    let absolute = std::path::absolute(root)?;
    let mut files = Vec::new();

    for entry in std::fs::read_dir(&absolute)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        if let Some(file) = file_stat(name, entry.metadata())? {
            files.push(file);
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((absolute.display().to_string(), files))
}

/// Regular files only. Entries renamed or removed mid-scan are skipped.
fn file_stat(name: String, metadata: std::io::Result<std::fs::Metadata>) -> std::io::Result<Option<FileStat>> {
    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some(FileStat {
        name,
        size: metadata.len(),
        modified: metadata.modified().map(DateTime::<Utc>::from)?,
    }))
}
