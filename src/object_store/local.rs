use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{physical_name, ObjectPath, ObjectReader, ObjectStore, ObjectStoreError, Producer};

/// Local filesystem object store.
///
/// Each namespace is a directory `<base>/<prefix>-<namespace>` and each
/// object a file below it. Writes go straight to the target file: a failed
/// or interrupted write leaves a truncated file behind, and concurrent
/// writers to one path may interleave.
pub struct LocalStore {
    base_path: PathBuf,
    prefix: String,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P, prefix: &str) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            prefix: prefix.to_string(),
        })
    }

    pub fn namespace_path(&self, namespace: &str) -> Result<PathBuf, ObjectStoreError> {
        if namespace.is_empty()
            || namespace == "."
            || namespace == ".."
            || namespace.contains(['/', '\\'])
        {
            return Err(ObjectStoreError::InvalidPath(format!(
                "namespace '{namespace}' is not a plain directory name"
            )));
        }
        Ok(self.base_path.join(physical_name(&self.prefix, namespace)))
    }

    fn object_path(
        &self,
        namespace: &str,
        path: &ObjectPath,
    ) -> Result<(PathBuf, PathBuf), ObjectStoreError> {
        let namespace_path = self.namespace_path(namespace)?;
        let object_path = path.to_local_path(&namespace_path)?;
        Ok((namespace_path, object_path))
    }
}

/// First ancestor of `target` below `namespace_path` that is a regular file.
/// Such a file shadows the directory the target would need.
async fn file_ancestor(namespace_path: &Path, target: &Path) -> Option<PathBuf> {
    for ancestor in target.ancestors().skip(1) {
        if ancestor == namespace_path {
            break;
        }
        if let Ok(meta) = tokio::fs::metadata(ancestor).await {
            if meta.is_file() {
                return Some(ancestor.to_path_buf());
            }
        }
    }
    None
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn create_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError> {
        let path = self.namespace_path(namespace)?;
        tokio::fs::create_dir_all(&path).await?;
        tracing::debug!(path = %path.display(), "Created namespace directory");
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ObjectStoreError> {
        let path = self.namespace_path(namespace)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Deleted namespace directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(
        &self,
        namespace: &str,
        path: &ObjectPath,
        producer: &mut dyn Producer,
    ) -> Result<(), ObjectStoreError> {
        let (namespace_path, target) = self.object_path(namespace, path)?;

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                if let Some(file) = file_ancestor(&namespace_path, &target).await {
                    return Err(ObjectStoreError::InvalidPath(format!(
                        "'{path}' lies below the existing object {}",
                        file.display()
                    )));
                }
                return Err(e.into());
            }
        }

        if tokio::fs::metadata(&target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(ObjectStoreError::InvalidPath(format!(
                "'{path}' is a prefix of existing objects"
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .await?;

        let mut sink = BufWriter::new(file);
        producer
            .produce(&mut sink)
            .await
            .map_err(ObjectStoreError::Producer)?;
        sink.flush().await?;
        Ok(())
    }

    async fn read(
        &self,
        namespace: &str,
        path: &ObjectPath,
    ) -> Result<ObjectReader, ObjectStoreError> {
        let (namespace_path, target) = self.object_path(namespace, path)?;
        let not_found = || ObjectStoreError::NotFound(format!("{namespace}/{path}"));

        let file = match File::open(&target).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                if file_ancestor(&namespace_path, &target).await.is_some() {
                    return Err(not_found());
                }
                return Err(e.into());
            }
        };

        if !file.metadata().await?.is_file() {
            return Err(not_found());
        }
        Ok(Box::new(file))
    }

    async fn delete(&self, namespace: &str, path: &ObjectPath) -> Result<(), ObjectStoreError> {
        let (namespace_path, target) = self.object_path(namespace, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // A directory is a prefix of other objects, not an object
                let is_dir = tokio::fs::metadata(&target)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                // Nothing can exist below a file
                if is_dir || file_ancestor(&namespace_path, &target).await.is_some() {
                    return Ok(());
                }
                Err(e.into())
            }
        }
    }
}
