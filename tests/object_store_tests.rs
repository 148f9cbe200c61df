use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use stowage::client::InMemoryClient;
use stowage::object_store::{
    FromReader, LocalStore, ObjectPath, ObjectStore, ObjectStoreError, Producer, RemoteStore,
    StagingArea,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const MIB: usize = 1024 * 1024;

fn path(key: &str) -> ObjectPath {
    key.parse().unwrap()
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

fn local_store(dir: &Path) -> LocalStore {
    LocalStore::new(dir, "it").unwrap()
}

fn remote_store(dir: &Path) -> (RemoteStore, Arc<InMemoryClient>) {
    let client = Arc::new(InMemoryClient::new());
    let staging = StagingArea::new(dir.join(".staging"));
    let store = RemoteStore::new(client.clone(), "it", "EU", staging);
    (store, client)
}

fn staged_files(dir: &Path) -> usize {
    let Ok(namespaces) = std::fs::read_dir(dir.join(".staging")) else {
        return 0;
    };
    namespaces
        .flatten()
        .filter_map(|ns| std::fs::read_dir(ns.path()).ok())
        .map(|files| files.count())
        .sum()
}

struct BrokenProducer;

#[async_trait::async_trait]
impl Producer for BrokenProducer {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        sink.write_all(b"half an object").await?;
        Err(std::io::Error::other("source went away"))
    }
}

async fn assert_round_trips(store: &dyn ObjectStore) {
    store.create_namespace("media").await.unwrap();

    for len in [0, 1, 5 * MIB, 5 * MIB + 1] {
        let key = path(&format!("blobs/{len}.bin"));
        let data = pattern(len);
        store
            .write("media", &key, &mut data.clone())
            .await
            .unwrap();
        assert_eq!(store.read_bytes("media", &key).await.unwrap(), data, "len {len}");
    }
}

async fn assert_overwrite_replaces(store: &dyn ObjectStore) {
    store.create_namespace("docs").await.unwrap();
    let key = path("readme.txt");

    store
        .write("docs", &key, &mut Bytes::from("a much longer first version"))
        .await
        .unwrap();
    store
        .write("docs", &key, &mut Bytes::from("short"))
        .await
        .unwrap();

    assert_eq!(
        store.read_bytes("docs", &key).await.unwrap(),
        Bytes::from("short")
    );
}

async fn assert_missing_things_delete_cleanly(store: &dyn ObjectStore) {
    store.delete_namespace("never-created").await.unwrap();

    store.create_namespace("ns").await.unwrap();
    store.delete("ns", &path("missing/object")).await.unwrap();
}

async fn assert_delete_namespace_removes_objects(store: &dyn ObjectStore) {
    store.create_namespace("album").await.unwrap();
    let keys = [path("a.jpg"), path("b/c.jpg"), path("b/d/e.jpg")];
    for key in &keys {
        store
            .write("album", key, &mut Bytes::from(key.to_string()))
            .await
            .unwrap();
    }

    store.delete_namespace("album").await.unwrap();

    for key in &keys {
        assert!(matches!(
            store.read("album", key).await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_local_create_namespace_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());

    store.create_namespace("ns").await.unwrap();
    store.create_namespace("ns").await.unwrap();
    assert!(dir.path().join("it-ns").is_dir());
}

#[tokio::test]
async fn test_local_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    assert_round_trips(&local_store(dir.path())).await;
}

#[tokio::test]
async fn test_local_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    assert_overwrite_replaces(&local_store(dir.path())).await;
}

#[tokio::test]
async fn test_local_delete_nonexistent() {
    let dir = tempfile::tempdir().unwrap();
    assert_missing_things_delete_cleanly(&local_store(dir.path())).await;
}

#[tokio::test]
async fn test_local_delete_namespace() {
    let dir = tempfile::tempdir().unwrap();
    assert_delete_namespace_removes_objects(&local_store(dir.path())).await;
    assert!(!dir.path().join("it-album").exists());
}

#[tokio::test]
async fn test_local_read_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());
    store.create_namespace("ns").await.unwrap();

    assert!(matches!(
        store.read("ns", &path("nope")).await,
        Err(ObjectStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_producer_failure_leaves_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());
    store.create_namespace("ns").await.unwrap();

    let key = path("partial.bin");
    let result = store.write("ns", &key, &mut BrokenProducer).await;
    assert!(matches!(result, Err(ObjectStoreError::Producer(_))));

    // Local writes are not atomic
    assert!(dir.path().join("it-ns").join("partial.bin").exists());
}

#[tokio::test]
async fn test_remote_create_namespace_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());

    store.create_namespace("ns").await.unwrap();
    store.create_namespace("ns").await.unwrap();
    assert!(client.has_bucket("it-ns"));
    assert_eq!(client.bucket_region("it-ns").as_deref(), Some("EU"));
}

#[tokio::test]
async fn test_remote_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    assert_round_trips(&store).await;

    assert_eq!(client.open_uploads(), 0);
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_remote_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _client) = remote_store(dir.path());
    assert_overwrite_replaces(&store).await;
}

#[tokio::test]
async fn test_remote_delete_nonexistent() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _client) = remote_store(dir.path());
    assert_missing_things_delete_cleanly(&store).await;
}

#[tokio::test]
async fn test_remote_delete_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    assert_delete_namespace_removes_objects(&store).await;

    assert!(!client.has_bucket("it-album"));
    assert!(!dir.path().join(".staging").join("it-album").exists());
}

#[tokio::test]
async fn test_remote_twelve_mib_uses_three_parts() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    store.create_namespace("big").await.unwrap();

    let data = pattern(12 * MIB);
    store
        .write("big", &path("video.mp4"), &mut data.clone())
        .await
        .unwrap();

    assert_eq!(
        client.uploaded_parts(),
        vec![(1, 5 * MIB), (2, 5 * MIB), (3, 2 * MIB)]
    );
    let completions = client.completions();
    assert_eq!(completions.len(), 1);
    let numbers: Vec<u32> = completions[0].iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(client.object("it-big", "video.mp4"), Some(data));
}

#[tokio::test]
async fn test_remote_producer_failure_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    store.create_namespace("ns").await.unwrap();

    let key = path("broken.bin");
    let result = store.write("ns", &key, &mut BrokenProducer).await;
    assert!(matches!(result, Err(ObjectStoreError::Producer(_))));

    assert!(client.object("it-ns", "broken.bin").is_none());
    assert!(client.uploaded_parts().is_empty());
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_remote_part_failure_aborts_upload() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    store.create_namespace("ns").await.unwrap();
    client.fail_part(2);

    let result = store
        .write("ns", &path("big.bin"), &mut pattern(12 * MIB))
        .await;
    assert!(matches!(result, Err(ObjectStoreError::Unavailable(_))));

    assert_eq!(client.uploaded_parts().len(), 1);
    assert_eq!(client.aborts(), 1);
    assert_eq!(client.open_uploads(), 0);
    assert!(client.object("it-ns", "big.bin").is_none());
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_remote_failed_write_keeps_previous_object() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    store.create_namespace("ns").await.unwrap();

    let key = path("stable.txt");
    store
        .write("ns", &key, &mut Bytes::from("v1"))
        .await
        .unwrap();

    client.fail_complete();
    assert!(store
        .write("ns", &key, &mut Bytes::from("v2"))
        .await
        .is_err());

    assert_eq!(
        store.read_bytes("ns", &key).await.unwrap(),
        Bytes::from("v1")
    );

    client.clear_faults();
    store
        .write("ns", &key, &mut Bytes::from("v2"))
        .await
        .unwrap();
    assert_eq!(
        store.read_bytes("ns", &key).await.unwrap(),
        Bytes::from("v2")
    );
}

#[tokio::test]
async fn test_remote_abort_failure_reports_commit_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    store.create_namespace("ns").await.unwrap();
    client.fail_part(3);
    client.fail_abort();

    let result = store
        .write("ns", &path("big.bin"), &mut pattern(12 * MIB))
        .await;
    match result {
        Err(ObjectStoreError::CommitAborted {
            bucket, key, parts, ..
        }) => {
            assert_eq!(bucket, "it-ns");
            assert_eq!(key, "big.bin");
            assert_eq!(parts, 2);
        }
        other => panic!("expected CommitAborted, got {other:?}"),
    }
    assert_eq!(client.open_uploads(), 1);
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_remote_concurrent_writers_leave_no_staging_files() {
    let dir = tempfile::tempdir().unwrap();
    let (store, client) = remote_store(dir.path());
    let store = Arc::new(store);
    store.create_namespace("ns").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let key = path(&format!("writer/{i}"));
            let mut data = Bytes::from(format!("payload {i}"));
            store.write("ns", &key, &mut data).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..8 {
        assert_eq!(
            client.object("it-ns", &format!("writer/{i}")),
            Some(Bytes::from(format!("payload {i}")))
        );
    }
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_from_reader_producer() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.txt");
    std::fs::write(&source, b"copied from disk").unwrap();

    let store = local_store(&dir.path().join("objects"));
    store.create_namespace("ns").await.unwrap();

    let file = tokio::fs::File::open(&source).await.unwrap();
    store
        .write("ns", &path("copy.txt"), &mut FromReader(file))
        .await
        .unwrap();

    assert_eq!(
        store.read_bytes("ns", &path("copy.txt")).await.unwrap(),
        Bytes::from("copied from disk")
    );
}
