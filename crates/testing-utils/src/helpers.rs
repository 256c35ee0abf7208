//! 测试辅助

use std::sync::Arc;
use std::time::Duration;

use hca_config::{AppConfig, BlobStoreType, ConsumerMode, MessageQueueType, StatusStoreType};
use hca_domain::{
    BlobStore, DispatchMessage, Message, MessageQueue, Run, StatusStore, StatusTracker,
};
use hca_infrastructure::{InMemoryBlobStore, InMemoryMessageQueue, InMemoryStatusStore};
use tempfile::TempDir;
use tokio::time::sleep;

use crate::builders::{MetadataDocumentBuilder, RunBuilder};
use crate::mocks::RecordingStatusStore;

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件成立或超时
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// 每个测试二进制调用一次即可
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

pub const IMAGE_BUCKET: &str = "images";
pub const IMAGE_PREFIX: &str = "plate1/";
pub const PIPELINE_BUCKET: &str = "pipelines";
pub const PIPELINE_KEY: &str = "cp/measure.cppipe";
pub const RECORD_BUCKET: &str = "records";
pub const RECORD_PREFIX: &str = "analysis_result/";

/// 全内存的流水线组件，临时目录作为工作节点和合并器的本地空间
pub struct PipelineFixture {
    _scratch: TempDir,
    pub config: Arc<AppConfig>,
    pub blob_store: Arc<InMemoryBlobStore>,
    pub status_store: Arc<RecordingStatusStore>,
    pub queue: Arc<InMemoryMessageQueue>,
}

impl PipelineFixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// 在默认测试配置上做修改
    pub fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let scratch = tempfile::tempdir().expect("failed to create scratch dir");
        let mut config = AppConfig::default();
        config.message_queue.r#type = MessageQueueType::InMemory;
        config.message_queue.receive_wait_seconds = 0;
        config.message_queue.poll_interval_ms = 10;
        config.status_store.r#type = StatusStoreType::InMemory;
        config.storage.r#type = BlobStoreType::InMemory;
        config.dispatcher.image_mount_dir = "/mnt/images/".to_string();
        config.worker.worker_id = "test-worker".to_string();
        config.worker.mode = ConsumerMode::Batch;
        config.worker.scratch_dir = scratch.path().join("worker");
        config.consolidator.mode = ConsumerMode::Batch;
        config.consolidator.scratch_dir = scratch.path().join("consolidator");
        customize(&mut config);

        let visibility_timeout = config.message_queue.visibility_timeout();
        Self {
            _scratch: scratch,
            config: Arc::new(config),
            blob_store: Arc::new(InMemoryBlobStore::new()),
            status_store: Arc::new(RecordingStatusStore::new(Arc::new(
                InMemoryStatusStore::new(),
            ))),
            queue: Arc::new(InMemoryMessageQueue::new(visibility_timeout)),
        }
    }

    pub fn blob_store_dyn(&self) -> Arc<dyn BlobStore> {
        self.blob_store.clone()
    }

    pub fn status_store_dyn(&self) -> Arc<dyn StatusStore> {
        self.status_store.clone()
    }

    pub fn queue_dyn(&self) -> Arc<dyn MessageQueue> {
        self.queue.clone()
    }

    pub fn tracker(&self) -> StatusTracker {
        StatusTracker::new(self.status_store_dyn())
    }

    pub fn dispatch_queue(&self) -> &str {
        &self.config.message_queue.dispatch_queue
    }

    pub fn consolidation_queue(&self) -> &str {
        &self.config.message_queue.consolidation_queue
    }

    /// 写入元数据文档（`{IMAGE_PREFIX}{name}`）和分析流程文件
    pub async fn seed_inputs(&self, name: &str, document: &MetadataDocumentBuilder) {
        self.put_text(IMAGE_BUCKET, &format!("{IMAGE_PREFIX}{name}"), &document.build())
            .await;
        self.put_text(PIPELINE_BUCKET, PIPELINE_KEY, "CellProfiler Pipeline: http://www.cellprofiler.org\n")
            .await;
    }

    pub async fn put_text(&self, bucket: &str, key: &str, text: &str) {
        self.blob_store
            .put(bucket, key, text.as_bytes().to_vec())
            .await
            .expect("in-memory put cannot fail");
    }

    pub async fn get_text(&self, bucket: &str, key: &str) -> Option<String> {
        self.blob_store
            .get(bucket, key)
            .await
            .ok()
            .map(|body| String::from_utf8_lossy(&body).into_owned())
    }

    /// 不经过元数据拆分，直接登记运行和任务、写入清单并投递分发消息
    pub async fn seed_dispatched_run(&self, run_id: &str, wells: &[&str]) -> (Run, Vec<DispatchMessage>) {
        let (run, tasks) = RunBuilder::new(run_id)
            .with_image_data(IMAGE_BUCKET, IMAGE_PREFIX)
            .with_pipeline(PIPELINE_BUCKET, PIPELINE_KEY)
            .with_record_location(RECORD_BUCKET, RECORD_PREFIX)
            .build_with_tasks(wells);
        self.put_text(PIPELINE_BUCKET, PIPELINE_KEY, "CellProfiler Pipeline: http://www.cellprofiler.org\n")
            .await;

        let tracker = self.tracker();
        tracker.register_run(&run).await.expect("register run");
        let mut messages = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let rowset = format!(
                "Row_Number,Column_Number,Well_Location,Field_Index,URL_DAPI\n1,1,{},1,file:/mnt/images/{}.tif\n",
                task.task_id, task.task_id
            );
            self.put_text(&task.input_rowset.bucket, &task.input_rowset.key, &rowset)
                .await;
            tracker.register_task(task).await.expect("register task");
            let message = DispatchMessage::for_task(
                &run,
                task,
                self.consolidation_queue(),
                self.config.consolidator.excluded_filename_patterns.clone(),
            );
            self.queue
                .enqueue(self.dispatch_queue(), &Message::task_dispatch(message.clone()))
                .await
                .expect("enqueue dispatch message");
            messages.push(message);
        }
        (run, messages)
    }

    /// 提交请求的 JSON 文本，指向默认的图像、流程和记录位置
    pub fn submission_json(&self, submitted_by: &str, run_id: &str) -> String {
        format!(
            r#"{{
  "image_data": {{"bucket": "{IMAGE_BUCKET}", "prefix": "{IMAGE_PREFIX}"}},
  "pipeline_file": {{"bucket": "{PIPELINE_BUCKET}", "key": "{PIPELINE_KEY}"}},
  "job_record_dir": {{"bucket": "{RECORD_BUCKET}", "prefix": "{RECORD_PREFIX}"}},
  "submitted_by": "{submitted_by}",
  "run_id": "{run_id}"
}}"#
        )
    }
}

impl Default for PipelineFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_for() {
        let counter = AtomicU32::new(0);
        let reached = TestEnv::wait_for(
            || async { counter.fetch_add(1, Ordering::SeqCst) >= 2 },
            Duration::from_secs(1),
        )
        .await;
        assert!(reached);
    }

    #[tokio::test]
    async fn test_fixture_seeds_inputs() {
        let fixture = PipelineFixture::new();
        let document = MetadataDocumentBuilder::new().with_well("A - 1", 1, 1, &[1], &["DAPI"]);
        fixture.seed_inputs("plate.xdce", &document).await;

        let xml = fixture
            .get_text(IMAGE_BUCKET, "plate1/plate.xdce")
            .await
            .unwrap();
        assert!(xml.contains("A - 1"));
        assert!(fixture.get_text(PIPELINE_BUCKET, PIPELINE_KEY).await.is_some());
        assert_eq!(fixture.dispatch_queue(), "hca-dispatch");
    }
}
