use super::{ObjectStore, ObjectStream, StorageError, StorageResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::Cursor;

/// Objects held in memory, keyed by `(bucket, key)`
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: impl Into<String>, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects.insert((bucket.into(), key.into()), body.into());
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectStream> {
        let body = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        Ok(Box::new(Cursor::new(body)))
    }
}
