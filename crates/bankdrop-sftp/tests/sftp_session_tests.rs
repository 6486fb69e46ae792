//! SFTP session tests over an in-memory channel
//!
//! NIST 800-53: SI-10 (Information Input Validation), SI-11 (Error Handling)
//! Implementation: drives `SftpSession` with framed packets the way an SSH
//! channel would deliver them.

use bankdrop_sftp::protocol::{
    FileAttrs, MessageType, OpenFlags, StatusCode, codec, read_packet, write_packet,
};
use bankdrop_sftp::{Config, SftpSession, UploadRootFs};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestClient {
    stream: DuplexStream,
    next_id: u32,
}

impl TestClient {
    async fn send(&mut self, packet: &[u8]) -> Vec<u8> {
        write_packet(&mut self.stream, packet).await.unwrap();
        read_packet(&mut self.stream, 1 << 20).await.unwrap().unwrap()
    }

    async fn init(&mut self) {
        let response = self.send(&[MessageType::Init as u8, 0, 0, 0, 3]).await;
        assert_eq!(response, vec![MessageType::Version as u8, 0, 0, 0, 3]);
    }

    async fn request(&mut self, msg_type: MessageType, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        self.next_id += 1;
        let mut packet = BytesMut::new();
        packet.put_u8(msg_type as u8);
        packet.put_u32(self.next_id);
        body(&mut packet);

        let response = self.send(&packet).await;
        let mut id = &response[1..5];
        assert_eq!(id.get_u32(), self.next_id, "response id mismatch");
        response
    }

    async fn open(&mut self, path: &str, flags: u32) -> Vec<u8> {
        let response = self
            .request(MessageType::Open, |b| {
                codec::put_string(b, path);
                b.put_u32(flags);
                b.put(FileAttrs::default().encode());
            })
            .await;
        expect_handle(&response)
    }

    async fn opendir(&mut self, path: &str) -> Vec<u8> {
        let response = self
            .request(MessageType::Opendir, |b| codec::put_string(b, path))
            .await;
        expect_handle(&response)
    }

    async fn with_handle(&mut self, msg_type: MessageType, handle: &[u8]) -> Vec<u8> {
        self.request(msg_type, |b| codec::put_bytes(b, handle)).await
    }
}

fn expect_handle(response: &[u8]) -> Vec<u8> {
    assert_eq!(response[0], MessageType::Handle as u8, "expected HANDLE, got {response:?}");
    let mut buf = &response[5..];
    codec::get_bytes(&mut buf).unwrap()
}

fn expect_status(response: &[u8]) -> StatusCode {
    assert_eq!(response[0], MessageType::Status as u8, "expected STATUS, got {response:?}");
    let mut buf = &response[5..];
    StatusCode::try_from(buf.get_u32()).unwrap()
}

fn expect_names(response: &[u8]) -> Vec<(String, FileAttrs)> {
    assert_eq!(response[0], MessageType::Name as u8, "expected NAME, got {response:?}");
    let mut buf = &response[5..];
    let count = buf.get_u32();
    (0..count)
        .map(|_| {
            let name = codec::get_string(&mut buf).unwrap();
            let _longname = codec::get_string(&mut buf).unwrap();
            (name, FileAttrs::decode(&mut buf).unwrap())
        })
        .collect()
}

fn start_session(temp_dir: &TempDir) -> (TestClient, CancellationToken, JoinHandle<bankdrop_sftp::Result<()>>) {
    let fs = Arc::new(UploadRootFs::new(temp_dir.path(), true));
    let session = SftpSession::new(fs, &Config::default(), None, Some("bank".into()));
    let (client, server) = tokio::io::duplex(256 * 1024);
    let token = CancellationToken::new();
    let task = tokio::spawn(session.run(server, token.clone()));
    (
        TestClient {
            stream: client,
            next_id: 0,
        },
        token,
        task,
    )
}

const UPLOAD: u32 = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;

/// Empty listing, upload of 100 bytes, then a listing with one entry of size 100
#[tokio::test]
async fn test_upload_and_list_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let (mut client, _token, _task) = start_session(&temp_dir);
    client.init().await;

    let dir = client.opendir("/").await;
    let response = client.with_handle(MessageType::Readdir, &dir).await;
    assert_eq!(expect_status(&response), StatusCode::Eof);
    let response = client.with_handle(MessageType::Close, &dir).await;
    assert_eq!(expect_status(&response), StatusCode::Ok);

    let file = client.open("/outbox/2024/data.csv", UPLOAD).await;
    let response = client
        .request(MessageType::Write, |b| {
            codec::put_bytes(b, &file);
            b.put_u64(0);
            codec::put_bytes(b, &[b'x'; 100]);
        })
        .await;
    assert_eq!(expect_status(&response), StatusCode::Ok);

    let response = client.with_handle(MessageType::Fstat, &file).await;
    assert_eq!(response[0], MessageType::Attrs as u8);

    let response = client.with_handle(MessageType::Close, &file).await;
    assert_eq!(expect_status(&response), StatusCode::Ok);

    let dir = client.opendir("/").await;
    let names = expect_names(&client.with_handle(MessageType::Readdir, &dir).await);
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].0, "data.csv");
    assert_eq!(names[0].1.size, Some(100));

    let response = client.with_handle(MessageType::Readdir, &dir).await;
    assert_eq!(expect_status(&response), StatusCode::Eof);

    assert_eq!(std::fs::read(temp_dir.path().join("data.csv")).unwrap(), vec![b'x'; 100]);
}

#[tokio::test]
async fn test_read_until_eof() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("rates.txt"), b"0.0425").unwrap();
    let (mut client, _token, _task) = start_session(&temp_dir);
    client.init().await;

    let file = client.open("rates.txt", OpenFlags::READ).await;
    let read = |offset: u64| {
        let file = file.clone();
        move |b: &mut BytesMut| {
            codec::put_bytes(b, &file);
            b.put_u64(offset);
            b.put_u32(1024);
        }
    };

    let response = client.request(MessageType::Read, read(0)).await;
    assert_eq!(response[0], MessageType::Data as u8);
    let mut buf = &response[5..];
    assert_eq!(codec::get_bytes(&mut buf).unwrap(), b"0.0425");

    let response = client.request(MessageType::Read, read(6)).await;
    assert_eq!(expect_status(&response), StatusCode::Eof);
}

/// A zero-length read mid-file is empty data, not end of file
#[tokio::test]
async fn test_zero_length_read_is_not_eof() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("rates.txt"), b"0.0425").unwrap();
    let (mut client, _token, _task) = start_session(&temp_dir);
    client.init().await;

    let file = client.open("rates.txt", OpenFlags::READ).await;
    let response = client
        .request(MessageType::Read, |b| {
            codec::put_bytes(b, &file);
            b.put_u64(2);
            b.put_u32(0);
        })
        .await;
    assert_eq!(response[0], MessageType::Data as u8);
    let mut buf = &response[5..];
    assert!(codec::get_bytes(&mut buf).unwrap().is_empty());
}

#[tokio::test]
async fn test_readdir_batches_large_directories() {
    let temp_dir = TempDir::new().unwrap();
    for i in 0..150 {
        std::fs::write(temp_dir.path().join(format!("f{i:03}")), b"").unwrap();
    }
    let (mut client, _token, _task) = start_session(&temp_dir);
    client.init().await;

    let dir = client.opendir(".").await;
    let first = expect_names(&client.with_handle(MessageType::Readdir, &dir).await);
    let second = expect_names(&client.with_handle(MessageType::Readdir, &dir).await);
    assert_eq!(first.len(), 100);
    assert_eq!(second.len(), 50);
    assert_eq!(
        expect_status(&client.with_handle(MessageType::Readdir, &dir).await),
        StatusCode::Eof
    );
}

#[tokio::test]
async fn test_error_statuses() {
    let temp_dir = TempDir::new().unwrap();
    let (mut client, _token, _task) = start_session(&temp_dir);
    client.init().await;

    let response = client
        .request(MessageType::Remove, |b| codec::put_string(b, "missing.csv"))
        .await;
    assert_eq!(expect_status(&response), StatusCode::NoSuchFile);

    let response = client
        .request(MessageType::Symlink, |b| {
            codec::put_string(b, "a");
            codec::put_string(b, "b");
        })
        .await;
    assert_eq!(expect_status(&response), StatusCode::OpUnsupported);

    let response = client.with_handle(MessageType::Readdir, b"nope").await;
    assert_eq!(expect_status(&response), StatusCode::BadMessage);
}

/// Closing the channel mid-upload discards the staged data
#[tokio::test]
async fn test_disconnect_discards_unfinished_upload() {
    let temp_dir = TempDir::new().unwrap();
    let (mut client, _token, task) = start_session(&temp_dir);
    client.init().await;

    let file = client.open("unfinished.csv", UPLOAD).await;
    client
        .request(MessageType::Write, |b| {
            codec::put_bytes(b, &file);
            b.put_u64(0);
            codec::put_bytes(b, b"partial");
        })
        .await;
    drop(client);

    task.await.unwrap().unwrap();
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancellation_ends_session() {
    let temp_dir = TempDir::new().unwrap();
    let (mut client, token, task) = start_session(&temp_dir);
    client.init().await;

    token.cancel();
    task.await.unwrap().unwrap();
}
