mod local;
mod path;
mod remote;
mod staging;

pub use local::LocalStore;
pub use path::{physical_name, ObjectPath};
pub use remote::{RemoteStore, DEFAULT_PART_SIZE};
pub use staging::{StagingArea, StagingFile};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Producer failed: {0}")]
    Producer(#[source] std::io::Error),
    /// The upload failed after parts were confirmed and the abort failed too.
    /// Uploaded parts may still be held (and billed) by the store.
    #[error(
        "Upload {upload_id} of {bucket}/{key} failed after {parts} confirmed part(s) \
         ({cause}) and could not be aborted: {abort_error}"
    )]
    CommitAborted {
        bucket: String,
        key: String,
        upload_id: String,
        parts: usize,
        cause: String,
        abort_error: String,
    },
}

/// Byte stream returned by [`ObjectStore::read`].
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Caller-supplied source of an object's bytes.
///
/// A producer writes the full content of the object into the sink it is
/// handed. An error aborts the write; whatever was already written is never
/// committed by the remote backend, but stays on disk for the local one.
#[async_trait]
pub trait Producer: Send {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()>;
}

#[async_trait]
impl Producer for Bytes {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        sink.write_all(self).await
    }
}

#[async_trait]
impl Producer for Vec<u8> {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        sink.write_all(self).await
    }
}

#[async_trait]
impl Producer for &'static [u8] {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        sink.write_all(self).await
    }
}

/// Producer that copies everything from a reader into the sink.
pub struct FromReader<R>(pub R);

#[async_trait]
impl<R: AsyncRead + Send + Unpin> Producer for FromReader<R> {
    async fn produce(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> std::io::Result<()> {
        tokio::io::copy(&mut self.0, sink).await?;
        Ok(())
    }
}

/// Namespaced object storage, backed by local disk or a remote store.
///
/// A namespace must be created before objects are written into it. Writes
/// fully replace any previous content. The remote backend publishes each
/// object atomically; the local backend writes in place and a failed write
/// leaves a partial file behind.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the namespace. Creating an existing namespace is a no-op.
    async fn create_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError>;

    /// Remove every object in the namespace, then the namespace itself.
    /// Succeeds if the namespace does not exist.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError>;

    async fn write(
        &self,
        namespace: &str,
        path: &ObjectPath,
        producer: &mut dyn Producer,
    ) -> Result<(), ObjectStoreError>;

    async fn read(
        &self,
        namespace: &str,
        path: &ObjectPath,
    ) -> Result<ObjectReader, ObjectStoreError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, namespace: &str, path: &ObjectPath) -> Result<(), ObjectStoreError>;

    /// Read an object fully into memory.
    async fn read_bytes(
        &self,
        namespace: &str,
        path: &ObjectPath,
    ) -> Result<Bytes, ObjectStoreError> {
        let mut reader = self.read(namespace, path).await?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }
}
