//! Primitive operations the remote backend needs from an object store.

mod gcs;
mod memory;

pub use gcs::GcsClient;
pub use memory::InMemoryClient;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::object_store::ObjectReader;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Backend error: {0}")]
    Backend(String),
    /// The key cannot be addressed by this store.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A part confirmed by the store, as passed to
/// [`StorageClient::complete_multipart_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// Opaque confirmation tag (ETag) returned for the part.
    pub tag: String,
}

/// Client for a bucket-based object store with multipart uploads.
///
/// Retries, timeouts and authentication are the implementation's business.
/// A missing bucket or key is reported as [`ClientError::NotFound`].
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ClientError>;

    /// Fails with [`ClientError::AlreadyExists`] if the bucket is already there.
    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ClientError>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ClientError>;

    /// Every key in the bucket.
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, ClientError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, ClientError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError>;

    /// Open a multipart upload session and return its upload id.
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ClientError>;

    /// Upload one part and return its confirmation tag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, ClientError>;

    /// Assemble the object from `parts`, which must be in ascending part order.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError>;

    /// Discard the session and every part uploaded to it.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ClientError>;
}
