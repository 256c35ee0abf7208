use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hca_config::{AppConfig, ConsolidatorConfig, ConsumerMode};
use hca_domain::{BlobStore, Delivery, MessageQueue, MessageType, ReceiptHandle};
use hca_infrastructure::ScratchArea;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::consolidator::ResultConsolidator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidatorSummary {
    pub received: usize,
    pub consolidated: usize,
    pub unacknowledged: usize,
}

pub struct ConsolidatorLoopBuilder {
    consolidator_id: String,
    queue: Arc<dyn MessageQueue>,
    blob_store: Arc<dyn BlobStore>,
    consolidation_queue: String,
    settings: ConsolidatorConfig,
    receive_wait: Duration,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

impl ConsolidatorLoopBuilder {
    pub fn new(
        consolidator_id: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            consolidator_id: consolidator_id.into(),
            queue,
            blob_store,
            consolidation_queue: "hca-consolidation".to_string(),
            settings: ConsolidatorConfig::default(),
            receive_wait: Duration::from_secs(20),
            poll_interval: Duration::from_millis(500),
            redelivery_delay: Duration::from_secs(60),
        }
    }

    pub fn with_config(mut self, config: &AppConfig) -> Self {
        self.consolidation_queue = config.message_queue.consolidation_queue.clone();
        self.settings = config.consolidator.clone();
        self.receive_wait = config.message_queue.receive_wait();
        self.poll_interval = config.message_queue.poll_interval();
        self.redelivery_delay = config.message_queue.redelivery_delay();
        self
    }

    pub fn consolidation_queue(mut self, queue: &str) -> Self {
        self.consolidation_queue = queue.to_string();
        self
    }

    pub fn mode(mut self, mode: ConsumerMode) -> Self {
        self.settings.mode = mode;
        self
    }

    pub fn max_messages(mut self, max_messages: Option<usize>) -> Self {
        self.settings.max_messages = max_messages;
        self
    }

    pub fn scratch_base(mut self, scratch_base: PathBuf) -> Self {
        self.settings.scratch_dir = scratch_base;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn build(self) -> ConsolidatorLoop {
        let scratch = ScratchArea::new(&self.settings.scratch_dir, &self.consolidator_id);
        ConsolidatorLoop {
            consolidator: ResultConsolidator::new(self.blob_store, scratch, &self.settings),
            consolidator_id: self.consolidator_id,
            queue: self.queue,
            consolidation_queue: self.consolidation_queue,
            mode: self.settings.mode,
            max_messages: self.settings.max_messages,
            receive_wait: self.receive_wait,
            poll_interval: self.poll_interval,
            redelivery_delay: self.redelivery_delay,
        }
    }
}

/// 合并队列的消费循环，失败的消息不确认，延迟 `redelivery_delay` 后重新可见
pub struct ConsolidatorLoop {
    consolidator_id: String,
    queue: Arc<dyn MessageQueue>,
    consolidator: ResultConsolidator,
    consolidation_queue: String,
    mode: ConsumerMode,
    max_messages: Option<usize>,
    receive_wait: Duration,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

impl ConsolidatorLoop {
    pub fn builder(
        consolidator_id: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        blob_store: Arc<dyn BlobStore>,
    ) -> ConsolidatorLoopBuilder {
        ConsolidatorLoopBuilder::new(consolidator_id, queue, blob_store)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> ConsolidatorSummary {
        info!(
            "合并器 {} 开始消费队列 {} ({:?})",
            self.consolidator_id, self.consolidation_queue, self.mode
        );
        let mut summary = ConsolidatorSummary::default();

        loop {
            if self
                .max_messages
                .is_some_and(|max_messages| summary.received >= max_messages)
            {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.recv() => {
                    info!("合并器 {} 收到关闭信号", self.consolidator_id);
                    break;
                }
                received = self.queue.receive(&self.consolidation_queue, self.receive_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    summary.received += 1;
                    self.handle_delivery(delivery, &mut summary).await;
                }
                Ok(None) if self.mode == ConsumerMode::Batch => {
                    info!("队列 {} 已空，合并器 {} 退出", self.consolidation_queue, self.consolidator_id);
                    break;
                }
                Ok(None) => {
                    if self.receive_wait.is_zero() {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                Err(e) => {
                    error!("从队列 {} 接收消息失败: {}", self.consolidation_queue, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("合并器 {} 已停止: {:?}", self.consolidator_id, summary);
        summary
    }

    async fn handle_delivery(&self, delivery: Delivery, summary: &mut ConsolidatorSummary) {
        let Delivery {
            message, receipt, ..
        } = delivery;
        let type_name = message.type_name();
        let consolidation = match message.message_type {
            MessageType::Consolidation(consolidation) => consolidation,
            MessageType::TaskDispatch(_) => {
                error!("合并队列中出现 {} 消息，已丢弃", type_name);
                if let Err(e) = self.acknowledge(&receipt).await {
                    warn!("丢弃消息时确认失败: {}", e);
                }
                return;
            }
        };

        match self.consolidator.consolidate(&consolidation).await {
            Ok(report) => match self.acknowledge(&receipt).await {
                Ok(()) => {
                    summary.consolidated += 1;
                    info!(
                        "运行 {} 合并完成，生成 {} 个文件",
                        report.run_id,
                        report.files.len()
                    );
                }
                Err(e) => {
                    summary.unacknowledged += 1;
                    warn!("运行 {} 的合并消息确认失败: {}", consolidation.run_id, e);
                }
            },
            Err(e) => {
                summary.unacknowledged += 1;
                metrics::counter!("hca_consolidation_failures_total").increment(1);
                error!(
                    "运行 {} 合并失败，{:?} 后重新投递: {}",
                    consolidation.run_id, self.redelivery_delay, e
                );
                if let Err(e) = self
                    .queue
                    .change_visibility(&self.consolidation_queue, &receipt, self.redelivery_delay)
                    .await
                {
                    warn!("调整合并消息可见性失败，等待可见性超时: {}", e);
                }
            }
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> hca_errors::PipelineResult<()> {
        self.queue.acknowledge(&self.consolidation_queue, receipt).await
    }
}
