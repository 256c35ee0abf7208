use std::path::{Path, PathBuf};

use hca_errors::PipelineResult;
use tracing::debug;

/// 每个工作实例私有的本地临时目录
///
/// ```text
/// {root}/input/
/// {root}/output/
/// ```
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    const INPUT_DIR: &'static str = "input";
    const OUTPUT_DIR: &'static str = "output";

    /// `owner` 通常是工作节点ID，保证多个实例互不干扰
    pub fn new(base: impl AsRef<Path>, owner: &str) -> Self {
        let safe_owner: String = owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            root: base.as_ref().join(safe_owner),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(Self::INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(Self::OUTPUT_DIR)
    }

    /// 清空后重新创建输入输出目录
    pub async fn prepare(&self) -> PipelineResult<()> {
        self.clear().await?;
        tokio::fs::create_dir_all(self.input_dir()).await?;
        tokio::fs::create_dir_all(self.output_dir()).await?;
        Ok(())
    }

    pub async fn clear(&self) -> PipelineResult<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!("已清空临时目录: {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 递归列出输出目录下的文件，返回 (本地路径, 以 `/` 分隔的相对路径)
    pub async fn output_files(&self) -> PipelineResult<Vec<(PathBuf, String)>> {
        let base = self.output_dir();
        let mut files = Vec::new();
        let mut pending = vec![base.clone()];

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
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let relative = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push((path.clone(), relative));
                }
            }
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_list_clear() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchArea::new(base.path(), "host-1/42");
        assert!(scratch.root().ends_with("host-1_42"));

        scratch.prepare().await.unwrap();
        tokio::fs::create_dir_all(scratch.output_dir().join("images"))
            .await
            .unwrap();
        tokio::fs::write(scratch.output_dir().join("m.csv"), "a").await.unwrap();
        tokio::fs::write(scratch.output_dir().join("images/x.png"), "b")
            .await
            .unwrap();

        let files = scratch.output_files().await.unwrap();
        let relative: Vec<&str> = files.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(relative, vec!["images/x.png", "m.csv"]);

        // 重新准备会清掉上一次的残留
        scratch.prepare().await.unwrap();
        assert!(scratch.output_files().await.unwrap().is_empty());

        scratch.clear().await.unwrap();
        assert!(!scratch.root().exists());
        scratch.clear().await.unwrap();
    }
}
