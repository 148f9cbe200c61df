//! Shared helpers for stowage unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::client::InMemoryClient;
use crate::object_store::{Producer, RemoteStore, StagingArea};

/// A remote store over a fresh in-memory client, staging under `temp_dir`.
pub fn remote_store(
    temp_dir: &tempfile::TempDir,
    part_size: u64,
) -> (RemoteStore, Arc<InMemoryClient>) {
    let client = Arc::new(InMemoryClient::new());
    let staging = StagingArea::new(temp_dir.path().join(".staging"));
    let store = RemoteStore::new(client.clone(), "unit-test", "EU", staging)
        .with_part_size(part_size);
    (store, client)
}

/// Number of staging files left anywhere under the store's staging root.
pub fn staged_file_count(store: &RemoteStore) -> usize {
    let Ok(namespaces) = std::fs::read_dir(store.staging().root()) else {
        return 0;
    };
    namespaces
        .flatten()
        .filter_map(|ns| std::fs::read_dir(ns.path()).ok())
        .map(|files| files.count())
        .sum()
}

/// Writes some bytes, then fails.
pub struct FailingProducer {
    prefix: &'static [u8],
}

impl FailingProducer {
    pub fn new(prefix: &'static [u8]) -> Self {
        Self { prefix }
    }
}

#[async_trait]
impl Producer for FailingProducer {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        sink.write_all(self.prefix).await?;
        Err(std::io::Error::other("producer gave up"))
    }
}
