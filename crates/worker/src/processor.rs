use std::path::PathBuf;
use std::sync::Arc;

use hca_domain::{
    sentinel_reports_complete, AnalysisRequest, AnalysisTool, BlobStore, DispatchMessage,
    StatusTracker, TaskFinalization, TaskKey, TaskStatus,
};
use hca_errors::PipelineResult;
use hca_infrastructure::ScratchArea;
use tracing::{debug, error, info, instrument, warn};

use crate::completion::{CompletionDetector, CompletionOutcome};

/// 一条分发消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: TaskKey,
    /// 本次处理得出的结果
    pub attempted: TaskStatus,
    /// 实际记录的终态（重复投递时可能是先前的结果）
    pub finalization: TaskFinalization,
    pub completion: CompletionOutcome,
}

/// 顺序执行单个任务：下载、分析、上传、清理、记录终态、完成检测
pub struct TaskProcessor {
    blob_store: Arc<dyn BlobStore>,
    tracker: StatusTracker,
    tool: Arc<dyn AnalysisTool>,
    detector: CompletionDetector,
    scratch: ScratchArea,
    sentinel_file_name: String,
}

impl TaskProcessor {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        tracker: StatusTracker,
        tool: Arc<dyn AnalysisTool>,
        detector: CompletionDetector,
        scratch: ScratchArea,
        sentinel_file_name: impl Into<String>,
    ) -> Self {
        Self {
            blob_store,
            tracker,
            tool,
            detector,
            scratch,
            sentinel_file_name: sentinel_file_name.into(),
        }
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    /// 返回 `Err` 表示状态存储或队列出错，消息不应被确认
    #[instrument(skip(self, message), fields(task = %message.task_key()))]
    pub async fn process(&self, message: &DispatchMessage) -> PipelineResult<TaskReport> {
        let key = message.task_key().clone();

        if self.tracker.mark_run_running(&message.run_id).await? {
            info!("运行 {} 开始执行", message.run_id);
        }

        let attempted = match self.analyze(message).await {
            Ok(status) => status,
            Err(e) => {
                error!("任务 {} 执行出错，标记为失败: {}", key, e);
                TaskStatus::Failed
            }
        };
        if let Err(e) = self.scratch.clear().await {
            warn!("清理临时目录失败: {}", e);
        }

        let finalization = self.tracker.finalize_task(&key, attempted).await?;
        if let TaskFinalization::AlreadyTerminal(previous) = finalization {
            info!("任务 {} 已是 {}，本次结果 {} 被忽略", key, previous, attempted);
        }

        let completion = self.detector.check(message).await?;
        Ok(TaskReport {
            task: key,
            attempted,
            finalization,
            completion,
        })
    }

    /// 工具失败返回 `Ok(Failed)`；存储或本地 IO 出错返回 `Err`
    async fn analyze(&self, message: &DispatchMessage) -> PipelineResult<TaskStatus> {
        self.scratch.prepare().await?;

        let rowset_path = self
            .scratch
            .input_dir()
            .join(message.input_rowset_location.file_name());
        let pipeline_path = self
            .scratch
            .input_dir()
            .join(message.pipeline_location.file_name());
        self.blob_store
            .download_file(
                &message.input_rowset_location.bucket,
                &message.input_rowset_location.key,
                &rowset_path,
            )
            .await?;
        self.blob_store
            .download_file(
                &message.pipeline_location.bucket,
                &message.pipeline_location.key,
                &pipeline_path,
            )
            .await?;

        let output_dir = self.scratch.output_dir();
        let request = AnalysisRequest {
            task_id: message.task_id.clone(),
            rowset_path,
            pipeline_path,
            sentinel_path: output_dir.join(&self.sentinel_file_name),
            output_dir,
        };

        let exit = match self.tool.run(&request).await {
            Ok(exit) => exit,
            Err(e) => {
                warn!("分析工具 {} 未能运行: {}", self.tool.name(), e);
                return Ok(TaskStatus::Failed);
            }
        };

        if !sentinel_reports_complete(&request.sentinel_path).await {
            warn!(
                "任务 {} 的哨兵文件缺失或未报告完成 (exit_code={:?})",
                message.task_id, exit.exit_code
            );
            return Ok(TaskStatus::Failed);
        }

        let uploaded = self.upload_outputs(message).await?;
        info!("任务 {} 完成，上传 {} 个输出文件", message.task_id, uploaded);
        Ok(TaskStatus::Finished)
    }

    async fn upload_outputs(&self, message: &DispatchMessage) -> PipelineResult<usize> {
        let files: Vec<(PathBuf, String)> = self.scratch.output_files().await?;
        for (path, relative) in &files {
            let key = format!("{}{}", message.output_prefix, relative);
            self.blob_store
                .upload_file(path, &message.run_record_bucket, &key)
                .await?;
            debug!("已上传 {}", key);
        }
        Ok(files.len())
    }
}
