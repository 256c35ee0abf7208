use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use hca_domain::{BlobStore, ListResult};
use hca_errors::{PipelineError, PipelineResult};
use tracing::{debug, instrument};

use super::build_listing;

/// 本地目录上的对象存储：`{root}/{bucket}/{key}`
#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    root: PathBuf,
}

impl LocalFsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PipelineResult<PathBuf> {
        if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
            return Err(PipelineError::storage_error(format!("无效的桶名称: {bucket}")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PipelineResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(PipelineError::storage_error(format!("无效的对象键: {key}")));
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }

    /// 递归收集目录下所有文件对应的键
    async fn collect_keys(
        &self,
        bucket_dir: &Path,
        start: &Path,
    ) -> PipelineResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![start.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(bucket_dir) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for LocalFsBlobStore {
    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> PipelineResult<ListResult> {
        let bucket_dir = self.bucket_dir(bucket)?;
        // 从前缀中最深的目录开始遍历
        let start = match prefix.rfind('/') {
            Some(idx) => self.object_path(bucket, &prefix[..idx])?,
            None => bucket_dir.clone(),
        };
        let keys = self.collect_keys(&bucket_dir, &start).await?;
        let listing = build_listing(prefix, keys.iter().map(String::as_str), recursive);
        debug!(
            "列举 {}/{}: {} 个目录, {} 个文件",
            bucket,
            prefix,
            listing.dirs.len(),
            listing.files.len()
        );
        Ok(listing)
    }

    async fn get(&self, bucket: &str, key: &str) -> PipelineResult<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::object_not_found(bucket, key))
            }
            Err(e) => Err(PipelineError::storage_error(format!(
                "读取 {bucket}/{key} 失败: {e}"
            ))),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> PipelineResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::storage_error(format!("创建目录 {} 失败: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| PipelineError::storage_error(format!("写入 {bucket}/{key} 失败: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path());

        store
            .put("records", "run/sub_tasks/A - 1/output/m.csv", b"a\n1\n".to_vec())
            .await
            .unwrap();
        store
            .put("records", "run/sub_tasks/A - 1/input/A - 1.csv", b"x".to_vec())
            .await
            .unwrap();
        store
            .put("records", "run/sub_tasks/B - 1/output/m.csv", b"a\n2\n".to_vec())
            .await
            .unwrap();

        let body = store
            .get("records", "run/sub_tasks/A - 1/output/m.csv")
            .await
            .unwrap();
        assert_eq!(body, b"a\n1\n");

        let flat = store.list("records", "run/sub_tasks/", false).await.unwrap();
        assert_eq!(
            flat.dirs,
            vec!["run/sub_tasks/A - 1/", "run/sub_tasks/B - 1/"]
        );
        assert!(flat.files.is_empty());

        let deep = store.list("records", "run/sub_tasks/", true).await.unwrap();
        assert_eq!(deep.files.len(), 3);

        let missing = store.list("records", "nothing/here/", true).await.unwrap();
        assert!(missing.files.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_and_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path());

        assert!(matches!(
            store.get("records", "nope.csv").await.unwrap_err(),
            PipelineError::ObjectNotFound { .. }
        ));
        assert!(store.put("records", "../escape", vec![]).await.is_err());
        assert!(store.put("../x", "k", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsBlobStore::new(dir.path().join("blobs"));
        let local = dir.path().join("local/in.txt");
        tokio::fs::create_dir_all(local.parent().unwrap()).await.unwrap();
        tokio::fs::write(&local, "hello").await.unwrap();

        store.upload_file(&local, "b", "k/in.txt").await.unwrap();
        let dest = dir.path().join("scratch/deep/out.txt");
        store.download_file("b", "k/in.txt", &dest).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "hello");
    }
}
