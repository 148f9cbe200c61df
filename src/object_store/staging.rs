use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use uuid::Uuid;

/// Local directory tree holding writes that have not been committed remotely.
///
/// Each namespace gets its own subdirectory. Files inside are named by a
/// random UUID, so concurrent writers never collide and no locking is needed.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Create the namespace's staging directory (and any missing parents).
    pub async fn ensure_namespace(&self, namespace: &str) -> io::Result<PathBuf> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the namespace's staging directory if it holds no files.
    /// Staging files of in-flight writes are left alone.
    pub async fn remove_namespace(&self, namespace: &str) -> io::Result<()> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if entries.next_entry().await?.is_some() {
            return Ok(());
        }
        match tokio::fs::remove_dir(&dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Create an empty, uniquely named staging file for `namespace`.
    pub async fn create(&self, namespace: &str) -> io::Result<(StagingFile, File)> {
        let dir = self.ensure_namespace(namespace).await?;
        let path = dir.join(Uuid::new_v4().to_string());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok((
            StagingFile {
                path,
                removed: false,
            },
            file,
        ))
    }
}

/// Ownership handle for one staging file.
///
/// The file is deleted by [`StagingFile::remove`], or on drop if that never
/// ran or failed, so an abandoned write does not leak it.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    removed: bool,
}

impl StagingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn size(&self) -> io::Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }

    pub async fn remove(mut self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                self.removed = true;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.removed = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
