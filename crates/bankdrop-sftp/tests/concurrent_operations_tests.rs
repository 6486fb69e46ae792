//! Concurrent operations tests
//!
//! NIST 800-53: SC-5 (Denial of Service Protection), SI-16 (Memory Protection)
//! Implementation: independent sessions sharing one upload root

use bankdrop_sftp::protocol::{FileAttrs, OpenFlags};
use bankdrop_sftp::{FileSystem, UploadRootFs};
use std::sync::Arc;
use tempfile::TempDir;

const UPLOAD: u32 = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;

async fn upload_in_chunks(fs: Arc<UploadRootFs>, name: String, byte: u8, chunks: usize) {
    let mut handle = fs
        .open(&name, OpenFlags(UPLOAD), &FileAttrs::default())
        .await
        .unwrap();
    let chunk = vec![byte; 4096];
    for i in 0..chunks {
        handle.write((i * chunk.len()) as u64, &chunk).await.unwrap();
        tokio::task::yield_now().await;
    }

    // Each writer reads back exactly what it wrote, whatever the others do.
    for i in 0..chunks {
        let data = handle.read((i * chunk.len()) as u64, 4096).await.unwrap();
        assert_eq!(data, chunk, "{name}: writer {byte} saw foreign data");
        tokio::task::yield_now().await;
    }
    handle.close().await.unwrap();
}

/// Same-name uploads never interleave: the survivor is one complete upload
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_name_uploads_last_writer_wins() {
    let temp_dir = TempDir::new().unwrap();
    let fs = Arc::new(UploadRootFs::new(temp_dir.path(), true));

    let writers: Vec<_> = (0..4u8)
        .map(|i| tokio::spawn(upload_in_chunks(Arc::clone(&fs), "ledger.csv".into(), b'a' + i, 16)))
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let content = std::fs::read(temp_dir.path().join("ledger.csv")).unwrap();
    assert_eq!(content.len(), 16 * 4096);
    let first = content[0];
    assert!(content.iter().all(|&b| b == first), "uploads interleaved");

    let entries = fs.list("/").await.unwrap();
    assert_eq!(entries.len(), 1, "staging files left behind: {entries:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_uploads_in_parallel() {
    let temp_dir = TempDir::new().unwrap();
    let fs = Arc::new(UploadRootFs::new(temp_dir.path(), true));

    let writers: Vec<_> = (0..10u8)
        .map(|i| tokio::spawn(upload_in_chunks(Arc::clone(&fs), format!("file-{i}.bin"), i, 4)))
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let entries = fs.list("/").await.unwrap();
    assert_eq!(entries.len(), 10);
    assert!(entries.iter().all(|e| e.attrs.size == Some(4 * 4096)));
}

/// A dropped (never closed) upload leaves nothing behind
#[tokio::test]
async fn test_abandoned_upload_is_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let fs = UploadRootFs::new(temp_dir.path(), true);

    let mut handle = fs
        .open("half.csv", OpenFlags(UPLOAD), &FileAttrs::default())
        .await
        .unwrap();
    handle.write(0, b"partial").await.unwrap();
    drop(handle);

    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}
