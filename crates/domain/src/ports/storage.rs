use std::path::Path;

use async_trait::async_trait;
use hca_errors::PipelineResult;
use tracing::debug;

/// 列举结果：直接子目录与文件键
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// 对象存储抽象，键使用 `/` 分隔
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `recursive` 为 false 时只返回 `prefix` 下一层的目录和文件
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool)
        -> PipelineResult<ListResult>;

    async fn get(&self, bucket: &str, key: &str) -> PipelineResult<Vec<u8>>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> PipelineResult<()>;

    async fn download_file(&self, bucket: &str, key: &str, dest: &Path) -> PipelineResult<()> {
        let body = self.get(bucket, key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, body).await?;
        debug!("已下载 {}/{} 到 {}", bucket, key, dest.display());
        Ok(())
    }

    async fn upload_file(&self, src: &Path, bucket: &str, key: &str) -> PipelineResult<()> {
        let body = tokio::fs::read(src).await?;
        self.put(bucket, key, body).await?;
        debug!("已上传 {} 到 {}/{}", src.display(), bucket, key);
        Ok(())
    }
}
