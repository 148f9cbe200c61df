//! stowage - namespaced object storage over swappable backends
//!
//! This crate stores opaque byte objects in named namespaces with:
//! - A local filesystem backend writing objects in place
//! - A remote backend staging each write locally, then committing it as a
//!   multipart upload that is aborted on failure
//! - Pluggable storage clients (Google Cloud Storage, in-memory)

pub mod client;
pub mod config;
pub mod object_store;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use tracing::info;

use config::{Config, StorageBackend};
use object_store::{LocalStore, ObjectStore, RemoteStore, StagingArea};

/// Build the configured backend.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::Local => {
            let store = LocalStore::new(&config.work_dir, &config.system_name)?;
            info!(
                work_dir = %config.work_dir.display(),
                "Using local storage backend"
            );
            Arc::new(store)
        }
        StorageBackend::Gcs => {
            let client = client::GcsClient::new(
                config.storage.gcs_credentials_file.as_deref(),
                config.storage.gcs_project.as_deref(),
                config.storage.request_timeout,
            )
            .await?;
            let staging = StagingArea::new(config.staging_dir());
            let store = RemoteStore::new(
                Arc::new(client),
                &config.system_name,
                &config.storage.region,
                staging,
            )
            .with_part_size(config.storage.part_size)
            .with_upload_concurrency(config.storage.upload_concurrency);
            info!(
                region = %config.storage.region,
                part_size = config.storage.part_size,
                "Using GCS storage backend"
            );
            Arc::new(store)
        }
    };
    Ok(store)
}
