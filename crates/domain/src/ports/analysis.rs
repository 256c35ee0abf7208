use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hca_errors::PipelineResult;

/// 分析工具成功时写入哨兵文件的首行内容
pub const SENTINEL_COMPLETE: &str = "Complete";

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub task_id: String,
    pub rowset_path: PathBuf,
    pub pipeline_path: PathBuf,
    pub output_dir: PathBuf,
    pub sentinel_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExit {
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// 外部图像分析工具
///
/// 返回 `Err` 仅表示工具无法启动；是否成功以哨兵文件为准。
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &AnalysisRequest) -> PipelineResult<ToolExit>;
}

/// 哨兵文件存在且首行恰好为 `Complete`
pub async fn sentinel_reports_complete(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .next()
            .map(|line| line.trim_end_matches('\r') == SENTINEL_COMPLETE)
            .unwrap_or(false),
        Err(_) => false,
    }
}
