//! End-to-end tests for the filesystem adapter and the upload protocol.

use blobftp_core::MetaStore;
use blobftp_ftp::listing::{
    format_list_line, format_mlsd_line, list_command, mlsd_command, mlsd_failure_reply,
};
use blobftp_ftp::{AbortReason, FsConfig, FsError, OpenFile, OpenMode, StorageFs, UploadState};
use blobftp_storage::{LocalFsBackend, MemoryBackend};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// A data connection that breaks on its first read.
struct BrokenConnection;

impl AsyncRead for BrokenConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "data connection reset",
        )))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_fs() -> (Arc<MemoryBackend>, StorageFs) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let fs = StorageFs::with_backend(backend.clone(), Arc::new(MetaStore::new()));
    (backend, fs)
}

fn local_fs() -> (TempDir, StorageFs) {
    init_tracing();
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let backend = Arc::new(LocalFsBackend::new(tmp.path().join("data")));
    let fs = StorageFs::with_backend(backend, Arc::new(MetaStore::new()));
    (tmp, fs)
}

/// Test that an aborted upload leaves nothing behind.
#[tokio::test]
async fn test_upload_start_then_abort() {
    let (_backend, fs) = memory_fs();

    let ticket = fs.uploads().start("/in/partial.bin").unwrap();
    assert!(fs.exists("/in/partial.bin"));
    assert_eq!(ticket.state(), UploadState::Pending);

    fs.uploads().abort(ticket, AbortReason::Incomplete).await;

    assert!(!fs.exists("/in/partial.bin"));
    assert!(fs.is_dir("/in"));
}

/// Test that a completed upload records its size and bumps the parent.
#[tokio::test]
async fn test_upload_success_updates_parent() {
    let (backend, fs) = memory_fs();
    fs.mkdir("/dir").await.unwrap();
    let links_before = fs.meta().resolve(&["dir"]).unwrap().links;

    let body = vec![7u8; 4096];
    let node = fs
        .upload("/dir/file.bin", Box::new(std::io::Cursor::new(body)))
        .await
        .unwrap();

    assert_eq!(node.size, 4096);
    assert_eq!(fs.get_size("/dir/file.bin").await.unwrap(), 4096);
    assert_eq!(fs.meta().resolve(&["dir"]).unwrap().links, links_before + 1);
    assert_eq!(backend.contents("dir/file.bin").unwrap().len(), 4096);
}

/// Test that a failed transfer rolls back its placeholder.
#[tokio::test]
async fn test_upload_backend_failure_rolls_back() {
    let (backend, fs) = memory_fs();
    backend.set_available(false);

    let err = fs
        .upload("/x/y.txt", Box::new(&b"data"[..]))
        .await
        .unwrap_err();

    assert!(matches!(err, FsError::BackendUnavailable(_)));
    assert_eq!(err.reply_code(), 451);
    assert!(!fs.exists("/x/y.txt"));
}

/// Test that a failed overwrite drops the record instead of keeping the
/// old size for a truncated object.
#[tokio::test]
async fn test_failed_overwrite_removes_record() {
    let (tmp, fs) = local_fs();
    fs.upload("/f.bin", Box::new(&b"0123456789"[..]))
        .await
        .unwrap();
    assert_eq!(fs.get_size("/f.bin").await.unwrap(), 10);

    let partial = (&b"abc"[..]).chain(BrokenConnection);
    assert!(fs.upload("/f.bin", Box::new(partial)).await.is_err());

    assert!(!fs.exists("/f.bin"));
    let on_disk = std::fs::metadata(tmp.path().join("data/f.bin")).unwrap();
    assert!(on_disk.len() < 10);
}

/// Test that concurrent uploads into one directory each bump its links.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_count_links() {
    let (_backend, fs) = memory_fs();
    let fs = Arc::new(fs);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let fs = Arc::clone(&fs);
            tokio::spawn(async move {
                fs.upload(&format!("/shared/f{i:02}"), Box::new(&b"abc"[..]))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task panicked").expect("upload");
    }

    let dir = fs.meta().resolve(&["shared"]).unwrap();
    assert_eq!(dir.links, 17);
    assert_eq!(fs.listdir("/shared").unwrap().len(), 16);
}

/// Test read-back, rename and delete through the local backend.
#[tokio::test]
async fn test_local_round_trip() {
    let (tmp, fs) = local_fs();
    fs.upload("/a/b/c.txt", Box::new(&b"hello ftp"[..]))
        .await
        .unwrap();
    assert!(tmp.path().join("data/a/b/c.txt").is_file());

    fs.rename("/a/b/c.txt", "/a/x/c.txt").await.unwrap();
    assert!(fs.is_dir("/a/x"));
    assert!(!fs.exists("/a/b/c.txt"));

    let OpenFile::Read(mut reader) = fs.open("/a/x/c.txt", OpenMode::Read).await.unwrap() else {
        panic!("expected a reader");
    };
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello ftp");

    fs.remove("/a/x/c.txt").await.unwrap();
    fs.rmdir("/a/x").await.unwrap();
    assert!(!tmp.path().join("data/a/x").exists());
    assert_eq!(fs.listdir("/a").unwrap(), vec!["b"]);
}

/// Test the error taxonomy for common misuse.
#[tokio::test]
async fn test_error_taxonomy() {
    let (_backend, fs) = memory_fs();
    fs.upload("/d/f.txt", Box::new(&b"1"[..])).await.unwrap();

    assert!(matches!(fs.rmdir("/d").await, Err(FsError::HasChildren(_))));
    assert!(matches!(fs.rmdir("/d/f.txt").await, Err(FsError::TypeMismatch { .. })));
    assert!(matches!(fs.remove("/d").await, Err(FsError::TypeMismatch { .. })));
    assert!(matches!(fs.listdir("/nope"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.stat("/nope").await, Err(FsError::NotFound(_))));
    assert!(matches!(fs.rename("/", "/root2").await, Err(FsError::InvalidPath { .. })));
    assert!(fs.is_file("/d/f.txt"));
    assert!(!fs.is_file("/d"));
}

/// Test LIST and MLSD output through the handler hooks.
#[tokio::test]
async fn test_listing_hooks() {
    let (_backend, fs) = memory_fs();
    fs.upload("/pub/readme.txt", Box::new(&b"12345"[..]))
        .await
        .unwrap();
    fs.mkdir("/pub/sub").await.unwrap();
    let now = blobftp_core::unix_now();

    let lines = list_command(&fs, "/pub", now).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("-rw-rw-rw-"));
    assert!(lines[0].ends_with(" readme.txt\r\n"));
    assert!(lines[0].contains("        5 "));
    assert!(lines[1].starts_with("drwxrwxrwx"));

    let single = list_command(&fs, "/pub/readme.txt", now).await.unwrap();
    assert_eq!(single.len(), 1);

    let missing = list_command(&fs, "/absent", now).await.unwrap_err();
    assert_eq!(missing.reply().to_string(), "550 File or directory does not exist.");

    let facts = mlsd_command(&fs, "/pub").await.unwrap();
    assert!(facts[0].starts_with("type=file;size=5;perm=elradfmw;modify="));
    assert!(facts[1].starts_with("type=dir;size=0;"));

    let err = mlsd_command(&fs, "/pub/readme.txt").await.unwrap_err();
    assert_eq!(mlsd_failure_reply(&err).code, 501);
}

/// Test that listings show a prefix directory's cached mtime.
#[tokio::test]
async fn test_listing_uses_cached_directory_mtime() {
    let (_backend, fs) = memory_fs();
    fs.mkdir("/pub/sub").await.unwrap();
    let sub = fs.meta().resolve(&["pub", "sub"]).unwrap();
    assert!(sub.mtime > 0);
    assert_eq!(fs.get_mtime("/pub/sub").await.unwrap(), 0);
    let now = blobftp_core::unix_now();

    let lines = list_command(&fs, "/pub", now).await.unwrap();
    assert_eq!(lines, vec![format_list_line(&sub, now, true)]);

    let facts = mlsd_command(&fs, "/pub").await.unwrap();
    assert_eq!(facts, vec![format_mlsd_line(&sub, true)]);
    assert!(!facts[0].contains("modify=19700101000000"));
}

/// Test that a persisted snapshot is picked up by a rebuilt filesystem.
#[tokio::test]
async fn test_snapshot_survives_rebuild() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let toml = format!(
        "[storage]\nbackend = \"local\"\nroot = {:?}\n\n[cache]\nsnapshot = {:?}\n",
        tmp.path().join("data").display().to_string(),
        tmp.path().join("cache.json").display().to_string(),
    );
    let config = FsConfig::from_toml_str(&toml).unwrap();

    let fs = config.build().await.unwrap();
    fs.upload("/kept/file.txt", Box::new(&b"persist me"[..]))
        .await
        .unwrap();
    fs.persist().unwrap();
    drop(fs);

    let rebuilt = config.build().await.unwrap();
    assert!(rebuilt.is_file("/kept/file.txt"));
    assert_eq!(rebuilt.get_size("/kept/file.txt").await.unwrap(), 10);
}
