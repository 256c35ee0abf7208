use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use hca_domain::{BlobStore, ListResult};
use hca_errors::{PipelineError, PipelineResult};
use tokio::sync::RwLock;

use super::build_listing;

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> PipelineResult<ListResult> {
        let buckets = self.buckets.read().await;
        Ok(match buckets.get(bucket) {
            Some(objects) => build_listing(prefix, objects.keys().map(String::as_str), recursive),
            None => ListResult::default(),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> PipelineResult<Vec<u8>> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| PipelineError::object_not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> PipelineResult<()> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }
}
