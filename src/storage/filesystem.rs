//! Local filesystem store laid out as `{root}/{bucket}/{key}`.

use super::{ObjectStore, ObjectStream, StorageError, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileSystemObjectStore {
    root: PathBuf,
}

impl FileSystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path, refusing anything that escapes the bucket
    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || bucket.contains(['/', '\\']) {
            return Err(StorageError::not_found(bucket, key));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for FileSystemObjectStore {
    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectStream> {
        let path = self.object_path(bucket, key)?;
        debug!(path = %path.display(), "Opening object");

        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(bucket, key)),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(StorageError::Timeout {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::io(bucket, key, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_object_under_bucket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads/daily")).unwrap();
        std::fs::write(dir.path().join("uploads/daily/a.csv"), "id\n1\n").unwrap();

        let store = FileSystemObjectStore::new(dir.path());
        let mut stream = store.fetch_object("uploads", "daily/a.csv").await.unwrap();
        let mut content = String::new();
        stream.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "id\n1\n");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemObjectStore::new(dir.path());
        let err = store.fetch_object("uploads", "nope.csv").await.err().unwrap();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_traversal_never_leaves_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemObjectStore::new(dir.path());
        let err = store.fetch_object("uploads", "../secret").await.err().unwrap();
        assert!(!err.is_retryable());
    }
}
