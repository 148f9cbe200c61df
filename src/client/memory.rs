use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::{ClientError, CompletedPart, StorageClient};
use crate::object_store::ObjectReader;

/// In-memory [`StorageClient`] with real multipart semantics.
///
/// Intended for tests and embedding. Parts are held per upload session until
/// the session is completed (tags are checked, the object is assembled) or
/// aborted (parts are dropped). Every part upload, completion and abort is
/// recorded, and individual calls can be made to fail.
pub struct InMemoryClient {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, Bucket>,
    faults: Faults,
    journal: Journal,
}

struct Bucket {
    region: String,
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Faults {
    part: Option<u32>,
    complete: bool,
    abort: bool,
}

#[derive(Default)]
struct Journal {
    parts: Vec<(u32, usize)>,
    completions: Vec<Vec<CompletedPart>>,
    aborts: usize,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Make every upload of `part_number` fail.
    pub fn fail_part(&self, part_number: u32) {
        self.state.lock().expect("lock poisoned").faults.part = Some(part_number);
    }

    /// Make every multipart completion fail.
    pub fn fail_complete(&self) {
        self.state.lock().expect("lock poisoned").faults.complete = true;
    }

    /// Make every multipart abort fail, leaving the session open.
    pub fn fail_abort(&self) {
        self.state.lock().expect("lock poisoned").faults.abort = true;
    }

    pub fn clear_faults(&self) {
        self.state.lock().expect("lock poisoned").faults = Faults::default();
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.buckets.contains_key(bucket)
    }

    pub fn bucket_region(&self, bucket: &str) -> Option<String> {
        let state = self.state.lock().expect("lock poisoned");
        state.buckets.get(bucket).map(|b| b.region.clone())
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key).cloned())
    }

    /// Sessions that were initiated but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.buckets.values().map(|b| b.uploads.len()).sum()
    }

    /// `(part_number, size)` of every successful part upload, in call order.
    pub fn uploaded_parts(&self) -> Vec<(u32, usize)> {
        self.state.lock().expect("lock poisoned").journal.parts.clone()
    }

    /// Part lists passed to successful completions, in call order.
    pub fn completions(&self) -> Vec<Vec<CompletedPart>> {
        let state = self.state.lock().expect("lock poisoned");
        state.journal.completions.clone()
    }

    /// Number of successful aborts.
    pub fn aborts(&self) -> usize {
        self.state.lock().expect("lock poisoned").journal.aborts
    }
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        f.debug_struct("InMemoryClient")
            .field("bucket_count", &state.buckets.len())
            .finish()
    }
}

impl State {
    fn bucket(&self, bucket: &str) -> Result<&Bucket, ClientError> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| ClientError::NotFound(format!("bucket {bucket}")))
    }

    fn bucket_mut(&mut self, bucket: &str) -> Result<&mut Bucket, ClientError> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| ClientError::NotFound(format!("bucket {bucket}")))
    }
}

impl Bucket {
    fn upload_mut(&mut self, key: &str, upload_id: &str) -> Result<&mut PendingUpload, ClientError> {
        match self.uploads.get_mut(upload_id) {
            Some(upload) if upload.key == key => Ok(upload),
            _ => Err(ClientError::NotFound(format!("upload {upload_id} for {key}"))),
        }
    }
}

#[async_trait]
impl StorageClient for InMemoryClient {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ClientError> {
        Ok(self.has_bucket(bucket))
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.buckets.contains_key(bucket) {
            return Err(ClientError::AlreadyExists(format!("bucket {bucket}")));
        }
        state.buckets.insert(
            bucket.to_string(),
            Bucket {
                region: region.to_string(),
                objects: BTreeMap::new(),
                uploads: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.bucket(bucket)?.objects.is_empty() {
            return Err(ClientError::Backend(format!("bucket {bucket} is not empty")));
        }
        state.buckets.remove(bucket);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, ClientError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.bucket(bucket)?.objects.keys().cloned().collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, ClientError> {
        let state = self.state.lock().expect("lock poisoned");
        let data = state
            .bucket(bucket)?
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{bucket}/{key}")))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.bucket_mut(bucket)?.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(format!("{bucket}/{key}"))),
        }
    }

    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let upload_id = Uuid::new_v4().to_string();
        state.bucket_mut(bucket)?.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.faults.part == Some(part_number) {
            return Err(ClientError::Backend(format!(
                "injected failure for part {part_number}"
            )));
        }

        let size = data.len();
        let tag = format!("\"{}\"", Uuid::new_v4().simple());
        state
            .bucket_mut(bucket)?
            .upload_mut(key, upload_id)?
            .parts
            .insert(part_number, (tag.clone(), data));
        state.journal.parts.push((part_number, size));
        Ok(tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.faults.complete {
            return Err(ClientError::Backend("injected completion failure".to_string()));
        }
        if parts.is_empty() {
            return Err(ClientError::Backend("no parts to complete".to_string()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(ClientError::Backend(
                "parts are not in ascending order".to_string(),
            ));
        }

        let target = state.bucket_mut(bucket)?;
        let upload = target.upload_mut(key, upload_id)?;
        let mut assembled = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((tag, data)) if *tag == part.tag => assembled.extend_from_slice(data),
                _ => {
                    return Err(ClientError::Backend(format!(
                        "invalid part {} for upload {upload_id}",
                        part.part_number
                    )))
                }
            }
        }

        target.uploads.remove(upload_id);
        target.objects.insert(key.to_string(), assembled.freeze());
        state.journal.completions.push(parts.to_vec());
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.faults.abort {
            return Err(ClientError::Backend("injected abort failure".to_string()));
        }

        let target = state.bucket_mut(bucket)?;
        target.upload_mut(key, upload_id)?;
        target.uploads.remove(upload_id);
        state.journal.aborts += 1;
        Ok(())
    }
}
