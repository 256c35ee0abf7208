//! 重试策略与带重试的对象存储包装器
//!
//! 对可重试的错误（存储、队列、IO）做有界次数的指数退避重试（带随机抖动），
//! 不可重试的错误（对象不存在、键非法等）直接返回。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hca_config::ResilienceConfig;
use hca_domain::{BlobStore, ListResult};
use hca_errors::PipelineResult;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.storage_max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// 第 `retry_count` 次重试前的等待时间
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponential = self.base_delay.as_millis() as f64 * 2f64.powi(retry_count as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut retry_count = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry_count < self.max_retries => {
                    let delay = self.delay_for(retry_count);
                    retry_count += 1;
                    warn!(
                        "操作 {} 失败 (第 {}/{} 次重试，{:?} 后进行): {}",
                        operation, retry_count, self.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct RetryingBlobStore {
    inner: Arc<dyn BlobStore>,
    policy: RetryPolicy,
}

impl RetryingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl BlobStore for RetryingBlobStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> PipelineResult<ListResult> {
        self.policy
            .run("list", || self.inner.list(bucket, prefix, recursive))
            .await
    }

    async fn get(&self, bucket: &str, key: &str) -> PipelineResult<Vec<u8>> {
        self.policy.run("get", || self.inner.get(bucket, key)).await
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> PipelineResult<()> {
        self.policy
            .run("put", || self.inner.put(bucket, key, body.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hca_errors::PipelineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.1,
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("get", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::storage_error("503 Slow Down"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: PipelineResult<()> = fast_policy(2)
            .run("put", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::storage_error("503"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_missing_object() {
        let attempts = AtomicU32::new(0);
        let result: PipelineResult<()> = fast_policy(5)
            .run("get", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::object_not_found("b", "k"))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::ObjectNotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
