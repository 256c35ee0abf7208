use std::sync::Arc;

use hca_domain::{
    BlobStore, DispatchMessage, Message, MessageQueue, Run, StatusTracker, Task,
};
use hca_errors::PipelineResult;
use tracing::{debug, info, instrument};

use crate::metadata::WellPartition;

/// 为每个孔写入输入清单、登记任务并投递分发消息
pub struct TaskDispatcher {
    blob_store: Arc<dyn BlobStore>,
    tracker: StatusTracker,
    queue: Arc<dyn MessageQueue>,
    dispatch_queue: String,
    consolidation_queue: String,
    excluded_filename_patterns: Vec<String>,
}

impl TaskDispatcher {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        tracker: StatusTracker,
        queue: Arc<dyn MessageQueue>,
        dispatch_queue: impl Into<String>,
        consolidation_queue: impl Into<String>,
    ) -> Self {
        Self {
            blob_store,
            tracker,
            queue,
            dispatch_queue: dispatch_queue.into(),
            consolidation_queue: consolidation_queue.into(),
            excluded_filename_patterns: Vec::new(),
        }
    }

    /// 随消息下发给合并步骤的排除模式
    pub fn with_excluded_patterns(mut self, patterns: Vec<String>) -> Self {
        self.excluded_filename_patterns = patterns;
        self
    }

    /// 顺序：先写清单，再登记任务，最后入队
    #[instrument(skip(self, run, partition), fields(run_id = %run.run_id, well = %partition.well))]
    pub async fn dispatch_partition(
        &self,
        run: &Run,
        partition: &WellPartition,
    ) -> PipelineResult<Task> {
        let task = Task::scheduled(run, &partition.well)?;

        let body = partition.to_csv()?;
        self.blob_store
            .put(&task.input_rowset.bucket, &task.input_rowset.key, body)
            .await?;
        debug!("输入清单已写入: {}", task.input_rowset);

        self.tracker.register_task(&task).await?;

        let message = Message::task_dispatch(DispatchMessage::for_task(
            run,
            &task,
            self.consolidation_queue.clone(),
            self.excluded_filename_patterns.clone(),
        ));
        self.queue.enqueue(&self.dispatch_queue, &message).await?;

        metrics::counter!("hca_dispatched_tasks_total").increment(1);
        info!("任务已分发: {} ({} 行)", task.key(), partition.rows.len());
        Ok(task)
    }

    pub async fn dispatch_all(
        &self,
        run: &Run,
        partitions: &[WellPartition],
    ) -> PipelineResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(partitions.len());
        for partition in partitions {
            tasks.push(self.dispatch_partition(run, partition).await?);
        }
        Ok(tasks)
    }
}
