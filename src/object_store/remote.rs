use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

use super::{
    physical_name, ObjectPath, ObjectReader, ObjectStore, ObjectStoreError, Producer,
    StagingArea, StagingFile,
};
use crate::client::{ClientError, CompletedPart, StorageClient};

/// Default multipart chunk size (5 MiB).
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Object store backed by a remote bucket store.
///
/// Each namespace is a bucket named `<prefix>-<namespace>`. Writes are
/// staged to a local file first, then committed with a multipart upload:
/// the object becomes visible only when the upload completes, and a failed
/// upload is aborted so no parts are left behind.
pub struct RemoteStore {
    client: Arc<dyn StorageClient>,
    prefix: String,
    region: String,
    staging: StagingArea,
    part_size: u64,
    upload_concurrency: usize,
}

/// Byte range of the staged file sent as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartRange {
    number: u32,
    offset: u64,
    len: u64,
}

/// Split `total` bytes into consecutive parts of at most `part_size` bytes,
/// numbered from 1. An empty object is sent as a single empty part.
fn plan_parts(total: u64, part_size: u64) -> Vec<PartRange> {
    if total == 0 {
        return vec![PartRange {
            number: 1,
            offset: 0,
            len: 0,
        }];
    }

    let mut parts = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut offset = 0;
    let mut number = 1;
    while offset < total {
        let len = part_size.min(total - offset);
        parts.push(PartRange {
            number,
            offset,
            len,
        });
        offset += len;
        number += 1;
    }
    parts
}

async fn read_part(staged: &Path, part: PartRange) -> std::io::Result<Bytes> {
    let mut file = File::open(staged).await?;
    file.seek(SeekFrom::Start(part.offset)).await?;
    let mut data = vec![0u8; part.len as usize];
    file.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

fn client_failure(operation: &str, e: ClientError) -> ObjectStoreError {
    match e {
        ClientError::InvalidKey(key) => ObjectStoreError::InvalidPath(key),
        e => ObjectStoreError::Unavailable(format!("{operation} failed: {e}")),
    }
}

impl RemoteStore {
    pub fn new(
        client: Arc<dyn StorageClient>,
        prefix: &str,
        region: &str,
        staging: StagingArea,
    ) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            region: region.to_string(),
            staging,
            part_size: DEFAULT_PART_SIZE,
            upload_concurrency: 1,
        }
    }

    /// Bytes per uploaded part. The store may require a minimum for every
    /// part but the last.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Maximum number of parts in flight per write.
    pub fn with_upload_concurrency(mut self, upload_concurrency: usize) -> Self {
        self.upload_concurrency = upload_concurrency.max(1);
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn bucket_name(&self, namespace: &str) -> String {
        physical_name(&self.prefix, namespace)
    }

    /// Run the producer into `file`, then upload the result.
    async fn stage_and_commit(
        &self,
        bucket: &str,
        key: &str,
        staged: &StagingFile,
        file: File,
        producer: &mut dyn Producer,
    ) -> Result<(), ObjectStoreError> {
        let mut sink = BufWriter::new(file);
        producer
            .produce(&mut sink)
            .await
            .map_err(ObjectStoreError::Producer)?;
        sink.flush().await?;
        drop(sink);

        let len = staged.size().await?;
        self.commit(bucket, key, staged.path(), len).await
    }

    /// Upload the staged file as a multipart upload.
    ///
    /// Every session that gets initiated ends up either completed or aborted;
    /// if the abort itself fails after parts were confirmed, the failure is
    /// reported as [`ObjectStoreError::CommitAborted`].
    async fn commit(
        &self,
        bucket: &str,
        key: &str,
        staged: &Path,
        len: u64,
    ) -> Result<(), ObjectStoreError> {
        let upload_id = self
            .client
            .initiate_multipart_upload(bucket, key)
            .await
            .map_err(|e| client_failure("Multipart initiation", e))?;
        debug!(bucket, key, upload_id = %upload_id, bytes = len, "Initiated multipart upload");

        let mut confirmed = Vec::new();
        let outcome = match self
            .upload_parts(bucket, key, &upload_id, staged, len, &mut confirmed)
            .await
        {
            Ok(()) => self
                .client
                .complete_multipart_upload(bucket, key, &upload_id, &confirmed)
                .await
                .map_err(|e| client_failure("Multipart completion", e)),
            Err(e) => Err(e),
        };

        let cause = match outcome {
            Ok(()) => {
                info!(
                    bucket,
                    key,
                    parts = confirmed.len(),
                    bytes = len,
                    "Committed object"
                );
                return Ok(());
            }
            Err(cause) => cause,
        };

        warn!(bucket, key, upload_id = %upload_id, error = %cause, "Aborting multipart upload");
        match self
            .client
            .abort_multipart_upload(bucket, key, &upload_id)
            .await
        {
            Ok(()) => Err(cause),
            Err(abort_error) => {
                error!(
                    bucket,
                    key,
                    upload_id = %upload_id,
                    parts = confirmed.len(),
                    error = %abort_error,
                    "Failed to abort multipart upload"
                );
                if confirmed.is_empty() {
                    Err(ObjectStoreError::Unavailable(format!(
                        "{cause}; abort of upload {upload_id} also failed: {abort_error}"
                    )))
                } else {
                    Err(ObjectStoreError::CommitAborted {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        upload_id,
                        parts: confirmed.len(),
                        cause: cause.to_string(),
                        abort_error: abort_error.to_string(),
                    })
                }
            }
        }
    }

    /// Upload every part of the staged file, collecting confirmations in
    /// `confirmed`. On success `confirmed` is sorted by part number.
    ///
    /// After the first failure no new part is started, but parts already in
    /// flight are awaited so every part the store holds is counted.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        staged: &Path,
        len: u64,
        confirmed: &mut Vec<CompletedPart>,
    ) -> Result<(), ObjectStoreError> {
        let failed = AtomicBool::new(false);
        let mut uploads = stream::iter(plan_parts(len, self.part_size))
            .take_while(|_| futures::future::ready(!failed.load(Ordering::Relaxed)))
            .map(|part| self.upload_part(bucket, key, upload_id, staged, part))
            .buffer_unordered(self.upload_concurrency);

        let mut first_error = None;
        while let Some(result) = uploads.next().await {
            match result {
                Ok(part) => confirmed.push(part),
                Err(e) => {
                    failed.store(true, Ordering::Relaxed);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        confirmed.sort_by_key(|part| part.part_number);
        Ok(())
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        staged: &Path,
        part: PartRange,
    ) -> Result<CompletedPart, ObjectStoreError> {
        let data = read_part(staged, part).await?;
        let tag = self
            .client
            .upload_part(bucket, key, upload_id, part.number, data)
            .await
            .map_err(|e| client_failure(&format!("Upload of part {}", part.number), e))?;

        debug!(bucket, key, part = part.number, bytes = part.len, "Uploaded part");
        Ok(CompletedPart {
            part_number: part.number,
            tag,
        })
    }
}

#[async_trait]
impl ObjectStore for RemoteStore {
    async fn create_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket_name(namespace);

        let exists = self
            .client
            .bucket_exists(&bucket)
            .await
            .map_err(|e| client_failure("Bucket lookup", e))?;

        if !exists {
            match self.client.create_bucket(&bucket, &self.region).await {
                Ok(()) => info!(bucket = %bucket, region = %self.region, "Created bucket"),
                Err(ClientError::AlreadyExists(_)) => {
                    debug!(bucket = %bucket, "Bucket created concurrently")
                }
                Err(e) => return Err(client_failure("Bucket creation", e)),
            }
        }

        self.staging.ensure_namespace(&bucket).await?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket_name(namespace);

        let exists = self
            .client
            .bucket_exists(&bucket)
            .await
            .map_err(|e| client_failure("Bucket lookup", e))?;

        if exists {
            let keys = self
                .client
                .list_objects(&bucket)
                .await
                .map_err(|e| client_failure("Object listing", e))?;

            for key in &keys {
                match self.client.delete_object(&bucket, key).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {}
                    Err(e) => return Err(client_failure("Object deletion", e)),
                }
            }

            match self.client.delete_bucket(&bucket).await {
                Ok(()) | Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(client_failure("Bucket deletion", e)),
            }
            info!(bucket = %bucket, objects = keys.len(), "Deleted bucket");
        }

        self.staging.remove_namespace(&bucket).await?;
        Ok(())
    }

    async fn write(
        &self,
        namespace: &str,
        path: &ObjectPath,
        producer: &mut dyn Producer,
    ) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket_name(namespace);
        let key = path.to_key();

        let (staged, file) = self.staging.create(&bucket).await?;
        let result = self
            .stage_and_commit(&bucket, &key, &staged, file, producer)
            .await;

        let staged_path = staged.path().to_path_buf();
        if let Err(e) = staged.remove().await {
            // The drop guard retries; the write outcome stands
            warn!(path = %staged_path.display(), error = %e, "Failed to remove staging file");
        }
        result
    }

    async fn read(
        &self,
        namespace: &str,
        path: &ObjectPath,
    ) -> Result<ObjectReader, ObjectStoreError> {
        let bucket = self.bucket_name(namespace);
        let key = path.to_key();

        match self.client.get_object(&bucket, &key).await {
            Ok(reader) => Ok(reader),
            Err(ClientError::NotFound(_)) => {
                Err(ObjectStoreError::NotFound(format!("{bucket}/{key}")))
            }
            Err(e) => Err(client_failure("Download", e)),
        }
    }

    async fn delete(&self, namespace: &str, path: &ObjectPath) -> Result<(), ObjectStoreError> {
        let bucket = self.bucket_name(namespace);
        let key = path.to_key();

        match self.client.delete_object(&bucket, &key).await {
            Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(client_failure("Delete", e)),
        }
    }
}
