use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use hca_config::AppConfig;
use hca_domain::{
    base_name, BlobLocation, BlobObject, BlobStore, MessageQueue, QueueDepth, Run, StatusTracker,
};
use hca_errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::metadata::MetadataSplitter;
use crate::task_dispatcher::TaskDispatcher;

/// 作业提交请求
///
/// ```json
/// {
///   "image_data": {"bucket": "images", "prefix": "plate1/"},
///   "pipeline_file": {"bucket": "pipelines", "key": "cp/measure.cppipe"},
///   "job_record_dir": {"bucket": "records", "prefix": "analysis_result/"},
///   "submitted_by": "alice"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub image_data: BlobLocation,
    pub pipeline_file: BlobObject,
    pub job_record_dir: BlobLocation,
    pub submitted_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl SubmissionRequest {
    pub fn from_json(body: &[u8]) -> PipelineResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| PipelineError::validation_error(format!("提交请求格式错误: {e}")))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let body = tokio::fs::read(path.as_ref()).await?;
        Self::from_json(&body)
    }

    /// 构造 Scheduled 运行记录，前缀统一补齐结尾的 `/`
    pub fn into_run(self) -> PipelineResult<Run> {
        let submit_timestamp = Utc::now();
        let run_id = self
            .run_id
            .unwrap_or_else(|| Run::generate_run_id(&self.submitted_by, submit_timestamp));
        Run::new(
            run_id,
            self.submitted_by,
            submit_timestamp,
            BlobLocation::new(self.image_data.bucket, self.image_data.prefix),
            self.pipeline_file,
            BlobLocation::new(self.job_record_dir.bucket, self.job_record_dir.prefix),
        )
    }
}

/// 分发完成后的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub run_id: String,
    pub metadata: BlobObject,
    pub task_ids: Vec<String>,
    pub queue_depth: QueueDepth,
}

/// 提交入口：定位元数据、拆分、登记运行并分发任务
pub struct JobSubmitter {
    config: Arc<AppConfig>,
    blob_store: Arc<dyn BlobStore>,
    tracker: StatusTracker,
    queue: Arc<dyn MessageQueue>,
    splitter: MetadataSplitter,
}

impl JobSubmitter {
    pub fn new(
        config: Arc<AppConfig>,
        blob_store: Arc<dyn BlobStore>,
        tracker: StatusTracker,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let splitter = MetadataSplitter::new(&config.dispatcher.image_mount_dir);
        Self {
            config,
            blob_store,
            tracker,
            queue,
            splitter,
        }
    }

    /// 图像前缀下（不递归）必须恰好有一个元数据文件
    pub async fn locate_metadata(&self, image_data: &BlobLocation) -> PipelineResult<BlobObject> {
        let extension = format!(".{}", self.config.dispatcher.metadata_extension);
        let listing = self
            .blob_store
            .list(&image_data.bucket, &image_data.prefix, false)
            .await?;
        let candidates: Vec<&String> = listing
            .files
            .iter()
            .filter(|key| base_name(key).ends_with(&extension))
            .collect();

        match candidates.as_slice() {
            [key] => Ok(BlobObject::new(image_data.bucket.clone(), key.as_str())),
            _ => {
                warn!(
                    "{} 下找到 {} 个 {} 元数据文件",
                    image_data,
                    candidates.len(),
                    extension
                );
                Err(PipelineError::validation_error(format!(
                    "期望 {image_data} 下恰好有 1 个 {extension} 元数据文件，实际找到 {} 个",
                    candidates.len()
                )))
            }
        }
    }

    #[instrument(skip(self, request), fields(submitted_by = %request.submitted_by))]
    pub async fn submit(&self, request: SubmissionRequest) -> PipelineResult<DispatchReport> {
        let run = request.into_run()?;

        // 校验和拆分在任何写入之前完成
        let metadata = self.locate_metadata(&run.image_data).await?;
        let body = self.blob_store.get(&metadata.bucket, &metadata.key).await?;
        let document = String::from_utf8(body).map_err(|e| {
            PipelineError::metadata_parse(format!("{metadata} 不是有效的 UTF-8: {e}"))
        })?;
        let partitions = self.splitter.split(&document, &run.image_data.prefix)?;
        if partitions.is_empty() {
            return Err(PipelineError::validation_error(format!(
                "元数据 {metadata} 中没有任何图像记录"
            )));
        }
        info!(
            "运行 {}: 元数据 {} 拆分为 {} 个孔",
            run.run_id,
            metadata,
            partitions.len()
        );

        self.tracker.register_run(&run).await?;

        let mq = &self.config.message_queue;
        let dispatcher = TaskDispatcher::new(
            self.blob_store.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            mq.dispatch_queue.clone(),
            mq.consolidation_queue.clone(),
        )
        .with_excluded_patterns(self.config.consolidator.excluded_filename_patterns.clone());
        let tasks = dispatcher.dispatch_all(&run, &partitions).await?;

        let queue_depth = self.queue.depth(&mq.dispatch_queue).await?;
        info!(
            "运行 {} 已分发 {} 个任务，队列中可见 {} 条，处理中 {} 条",
            run.run_id,
            tasks.len(),
            queue_depth.visible,
            queue_depth.in_flight
        );

        Ok(DispatchReport {
            run_id: run.run_id,
            metadata,
            task_ids: tasks.into_iter().map(|t| t.task_id).collect(),
            queue_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let body = br#"{
            "image_data": {"bucket": "images", "prefix": "plate1"},
            "pipeline_file": {"bucket": "pipelines", "key": "measure.cppipe"},
            "job_record_dir": {"bucket": "records", "prefix": "analysis_result"},
            "submitted_by": "alice"
        }"#;
        let request = SubmissionRequest::from_json(body).unwrap();
        assert!(request.run_id.is_none());

        let run = request.into_run().unwrap();
        assert!(run.run_id.starts_with("alice_"));
        assert_eq!(run.image_data.prefix, "plate1/");
        assert_eq!(run.record_location.prefix, "analysis_result/");
    }

    #[test]
    fn test_explicit_run_id_and_bad_json() {
        let body = br#"{
            "image_data": {"bucket": "images", "prefix": "p/"},
            "pipeline_file": {"bucket": "pipelines", "key": "m.cppipe"},
            "job_record_dir": {"bucket": "records", "prefix": ""},
            "submitted_by": "bob",
            "run_id": "bob_fixed"
        }"#;
        let run = SubmissionRequest::from_json(body).unwrap().into_run().unwrap();
        assert_eq!(run.run_id, "bob_fixed");
        assert_eq!(run.layout().run_root(), "bob_fixed/");

        assert!(matches!(
            SubmissionRequest::from_json(b"{\"submitted_by\": 1}").unwrap_err(),
            PipelineError::ValidationError(_)
        ));
    }
}
