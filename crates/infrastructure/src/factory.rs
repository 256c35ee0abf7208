use std::sync::Arc;

use hca_config::{
    BlobStoreType, MessageQueueConfig, MessageQueueType, ResilienceConfig, StatusStoreConfig,
    StatusStoreType, StorageConfig,
};
use hca_domain::{BlobStore, MessageQueue, StatusStore};
use hca_errors::PipelineResult;
use tracing::{debug, info};

use crate::{
    InMemoryBlobStore, InMemoryMessageQueue, InMemoryStatusStore, LocalFsBlobStore,
    RabbitMQMessageQueue, RetryPolicy, RetryingBlobStore, SqliteStatusStore,
};

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(config: &MessageQueueConfig) -> PipelineResult<Arc<dyn MessageQueue>> {
        debug!("Creating message queue with type: {:?}", config.r#type);

        match config.r#type {
            MessageQueueType::Rabbitmq => {
                info!("Initializing RabbitMQ message queue");
                let rabbitmq = RabbitMQMessageQueue::new(config).await?;
                Ok(Arc::new(rabbitmq))
            }
            MessageQueueType::InMemory => {
                info!("Initializing in-memory message queue");
                Ok(Arc::new(InMemoryMessageQueue::new(config.visibility_timeout())))
            }
        }
    }
}

pub struct StatusStoreFactory;

impl StatusStoreFactory {
    pub async fn create(config: &StatusStoreConfig) -> PipelineResult<Arc<dyn StatusStore>> {
        debug!("Creating status store with type: {:?}", config.r#type);

        match config.r#type {
            StatusStoreType::Sqlite => Ok(Arc::new(SqliteStatusStore::connect(config).await?)),
            StatusStoreType::InMemory => Ok(Arc::new(InMemoryStatusStore::new())),
        }
    }
}

pub struct BlobStoreFactory;

impl BlobStoreFactory {
    /// 创建对象存储并包上重试层
    pub fn create(config: &StorageConfig, resilience: &ResilienceConfig) -> Arc<dyn BlobStore> {
        let inner: Arc<dyn BlobStore> = match config.r#type {
            BlobStoreType::LocalFs => {
                info!("使用本地目录作为对象存储: {}", config.root_dir.display());
                Arc::new(LocalFsBlobStore::new(config.root_dir.clone()))
            }
            BlobStoreType::InMemory => Arc::new(InMemoryBlobStore::new()),
        };
        Arc::new(RetryingBlobStore::new(inner, RetryPolicy::from(resilience)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_in_memory_backends() {
        let queue = MessageQueueFactory::create(&MessageQueueConfig::default())
            .await
            .unwrap();
        assert!(queue
            .receive("hca-dispatch", Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        let store = StatusStoreFactory::create(&StatusStoreConfig::default())
            .await
            .unwrap();
        assert!(store.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_local_blob_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            r#type: BlobStoreType::LocalFs,
            root_dir: dir.path().to_path_buf(),
        };
        let store = BlobStoreFactory::create(&config, &ResilienceConfig::default());
        store.put("b", "k.txt", b"v".to_vec()).await.unwrap();
        assert!(dir.path().join("b/k.txt").exists());
    }
}
