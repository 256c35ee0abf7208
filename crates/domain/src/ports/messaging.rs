use std::time::Duration;

use async_trait::async_trait;
use hca_errors::PipelineResult;

use crate::messaging::{Delivery, Message, QueueDepth, ReceiptHandle};

/// 至少一次投递、无序的消息队列
///
/// 接收到的消息在可见性超时内对其他消费者不可见；
/// 未确认的消息在超时后重新投递。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, message: &Message) -> PipelineResult<()>;

    /// 最多等待 `wait`，队列为空时返回 `None`
    async fn receive(&self, queue: &str, wait: Duration) -> PipelineResult<Option<Delivery>>;

    async fn acknowledge(&self, queue: &str, receipt: &ReceiptHandle) -> PipelineResult<()>;

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> PipelineResult<()>;

    /// 立即归还消息，使其重新可见
    async fn return_message(&self, queue: &str, receipt: &ReceiptHandle) -> PipelineResult<()> {
        self.change_visibility(queue, receipt, Duration::ZERO).await
    }

    async fn depth(&self, queue: &str) -> PipelineResult<QueueDepth>;
}
