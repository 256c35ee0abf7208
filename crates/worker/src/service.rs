use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hca_config::{AppConfig, ConsumerMode};
use hca_domain::{
    AnalysisTool, BlobStore, Delivery, DispatchMessage, MessageQueue, MessageType, ReceiptHandle,
    StatusTracker, TaskStatus,
};
use hca_errors::PipelineResult;
use hca_infrastructure::{RetryPolicy, ScratchArea};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::completion::CompletionDetector;
use crate::processor::TaskProcessor;

/// 循环退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub received: usize,
    pub finished: usize,
    pub failed: usize,
    /// 处理出错、消息未确认的次数
    pub unacknowledged: usize,
}

pub struct WorkerLoopBuilder {
    worker_id: String,
    queue: Arc<dyn MessageQueue>,
    blob_store: Arc<dyn BlobStore>,
    tracker: StatusTracker,
    tool: Arc<dyn AnalysisTool>,
    dispatch_queue: String,
    mode: ConsumerMode,
    max_tasks: Option<usize>,
    receive_wait: Duration,
    poll_interval: Duration,
    scratch_base: PathBuf,
    sentinel_file_name: String,
    redelivery_delay: Duration,
    retry: RetryPolicy,
}

impl WorkerLoopBuilder {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        blob_store: Arc<dyn BlobStore>,
        tracker: StatusTracker,
        tool: Arc<dyn AnalysisTool>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            blob_store,
            tracker,
            tool,
            dispatch_queue: "hca-dispatch".to_string(),
            mode: ConsumerMode::LongPoll,
            max_tasks: None,
            receive_wait: Duration::from_secs(20),
            poll_interval: Duration::from_millis(500),
            scratch_base: std::env::temp_dir().join("hca-worker"),
            sentinel_file_name: "done.txt".to_string(),
            redelivery_delay: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    /// 从进程配置中读取队列、模式和本地目录设置
    pub fn with_config(self, config: &AppConfig) -> Self {
        self.dispatch_queue(&config.message_queue.dispatch_queue)
            .mode(config.worker.mode)
            .max_tasks(config.worker.max_tasks)
            .receive_wait(config.message_queue.receive_wait())
            .poll_interval(config.message_queue.poll_interval())
            .scratch_base(config.worker.scratch_dir.clone())
            .sentinel_file_name(&config.worker.analysis_tool.sentinel_file_name)
            .redelivery_delay(config.message_queue.redelivery_delay())
            .retry_policy(RetryPolicy::from(&config.resilience))
    }

    pub fn dispatch_queue(mut self, queue: &str) -> Self {
        self.dispatch_queue = queue.to_string();
        self
    }

    pub fn mode(mut self, mode: ConsumerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_tasks(mut self, max_tasks: Option<usize>) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn scratch_base(mut self, scratch_base: PathBuf) -> Self {
        self.scratch_base = scratch_base;
        self
    }

    pub fn sentinel_file_name(mut self, name: &str) -> Self {
        self.sentinel_file_name = name.to_string();
        self
    }

    /// 处理出错的消息多久后重新可见
    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// 投递合并消息时的重试策略
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> WorkerLoop {
        let detector = CompletionDetector::new(self.tracker.clone(), self.queue.clone())
            .with_retry_policy(self.retry);
        let processor = TaskProcessor::new(
            self.blob_store,
            self.tracker,
            self.tool,
            detector,
            ScratchArea::new(&self.scratch_base, &self.worker_id),
            self.sentinel_file_name,
        );
        WorkerLoop {
            worker_id: self.worker_id,
            queue: self.queue,
            processor,
            dispatch_queue: self.dispatch_queue,
            mode: self.mode,
            max_tasks: self.max_tasks,
            receive_wait: self.receive_wait,
            poll_interval: self.poll_interval,
            redelivery_delay: self.redelivery_delay,
        }
    }
}

/// 工作节点的消费循环，一次只处理一个任务
pub struct WorkerLoop {
    worker_id: String,
    queue: Arc<dyn MessageQueue>,
    processor: TaskProcessor,
    dispatch_queue: String,
    mode: ConsumerMode,
    max_tasks: Option<usize>,
    receive_wait: Duration,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

impl WorkerLoop {
    pub fn builder(
        worker_id: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        blob_store: Arc<dyn BlobStore>,
        tracker: StatusTracker,
        tool: Arc<dyn AnalysisTool>,
    ) -> WorkerLoopBuilder {
        WorkerLoopBuilder::new(worker_id, queue, blob_store, tracker, tool)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 运行到收到关闭信号；批处理模式下队列取空或达到任务上限时提前退出
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> WorkerSummary {
        info!(
            "工作节点 {} 开始消费队列 {} ({:?})",
            self.worker_id, self.dispatch_queue, self.mode
        );
        let mut summary = WorkerSummary::default();

        loop {
            if self
                .max_tasks
                .is_some_and(|max_tasks| summary.received >= max_tasks)
            {
                info!("工作节点 {} 已处理 {} 个任务，退出", self.worker_id, summary.received);
                break;
            }

            let received = tokio::select! {
                _ = shutdown.recv() => {
                    info!("工作节点 {} 收到关闭信号", self.worker_id);
                    break;
                }
                received = self.queue.receive(&self.dispatch_queue, self.receive_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    summary.received += 1;
                    self.handle_delivery(delivery, &mut summary).await;
                }
                Ok(None) if self.mode == ConsumerMode::Batch => {
                    info!("队列 {} 已空，工作节点 {} 退出", self.dispatch_queue, self.worker_id);
                    break;
                }
                Ok(None) => {
                    if self.receive_wait.is_zero() {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                Err(e) => {
                    error!("从队列 {} 接收消息失败: {}", self.dispatch_queue, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("工作节点 {} 已停止: {:?}", self.worker_id, summary);
        summary
    }

    async fn handle_delivery(&self, delivery: Delivery, summary: &mut WorkerSummary) {
        let Delivery {
            message,
            receipt,
            receive_count,
        } = delivery;
        let type_name = message.type_name();
        let task = match message.message_type {
            MessageType::TaskDispatch(task) => task,
            MessageType::Consolidation(_) => {
                error!("分发队列中出现 {} 消息，已丢弃", type_name);
                if let Err(e) = self.acknowledge(&receipt).await {
                    warn!("丢弃消息时确认失败: {}", e);
                }
                return;
            }
        };

        if receive_count > 1 {
            info!("任务 {} 第 {} 次投递", task.task_key(), receive_count);
        }

        match self.process_and_acknowledge(&task, &receipt).await {
            Ok(status) => {
                match status {
                    TaskStatus::Failed => summary.failed += 1,
                    _ => summary.finished += 1,
                }
                metrics::counter!("hca_tasks_processed_total", "outcome" => status.as_str())
                    .increment(1);
            }
            Err(e) => {
                summary.unacknowledged += 1;
                metrics::counter!("hca_tasks_processed_total", "outcome" => "error").increment(1);
                error!(
                    "任务 {} 处理出错，{:?} 后重新投递: {}",
                    task.task_key(),
                    self.redelivery_delay,
                    e
                );
                if let Err(e) = self
                    .queue
                    .change_visibility(&self.dispatch_queue, &receipt, self.redelivery_delay)
                    .await
                {
                    warn!("调整消息可见性失败，等待可见性超时: {}", e);
                }
            }
        }
    }

    async fn process_and_acknowledge(
        &self,
        task: &DispatchMessage,
        receipt: &ReceiptHandle,
    ) -> PipelineResult<TaskStatus> {
        let report = self.processor.process(task).await?;
        self.acknowledge(receipt).await?;
        debug!("任务 {} 的消息已确认", report.task);
        Ok(report.finalization.status())
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> PipelineResult<()> {
        self.queue.acknowledge(&self.dispatch_queue, receipt).await
    }
}
