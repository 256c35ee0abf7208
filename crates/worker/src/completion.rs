//! 运行完成检测
//!
//! 每个任务进入终态后由处理它的工作节点调用。多个节点可能同时检测到
//! 同一个运行已经完成，只有条件写 `Running -> 终态` 的胜出者负责投递合并消息。
//! 胜出的任务记录在运行上；投递失败时该任务的消息会被重新投递，
//! 届时在 `consolidation_enqueued` 置位之前再次投递合并消息。

use std::sync::Arc;

use hca_domain::{
    DispatchMessage, Message, MessageQueue, RunProgress, RunStatus, StatusTracker,
};
use hca_errors::PipelineResult;
use hca_infrastructure::RetryPolicy;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// 仍有任务未结束
    Incomplete { scheduled: usize },
    /// 运行已完成，但终态由其他节点写入
    AlreadyClaimed(RunStatus),
    /// 本节点写入了终态并投递了合并消息
    ConsolidationEnqueued(RunStatus),
    /// 胜出任务被重新投递，补发了此前失败的合并消息
    ConsolidationRecovered(RunStatus),
}

#[derive(Clone)]
pub struct CompletionDetector {
    tracker: StatusTracker,
    queue: Arc<dyn MessageQueue>,
    retry: RetryPolicy,
}

impl CompletionDetector {
    pub fn new(tracker: StatusTracker, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            tracker,
            queue,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[instrument(skip(self, message), fields(run_id = %message.run_id, task_id = %message.task_id))]
    pub async fn check(&self, message: &DispatchMessage) -> PipelineResult<CompletionOutcome> {
        let run_id = message.run_id.as_str();

        // 条件写失败说明运行已不在 Scheduled，忽略即可
        self.tracker.mark_run_running(run_id).await?;

        let tasks = self.tracker.query_tasks(run_id).await?;
        let outcome = match RunProgress::from_task_statuses(tasks.iter().map(|t| t.status)) {
            RunProgress::Incomplete { scheduled } => {
                debug!("运行 {} 还有 {} 个任务未完成", run_id, scheduled);
                return Ok(CompletionOutcome::Incomplete { scheduled });
            }
            RunProgress::Complete(outcome) => outcome,
        };

        if self
            .tracker
            .claim_completion(run_id, outcome, &message.task_id)
            .await?
        {
            self.enqueue_consolidation(message, outcome).await?;
            return Ok(CompletionOutcome::ConsolidationEnqueued(outcome));
        }

        let run = self.tracker.get_run(run_id).await?;
        if run.completed_by.as_deref() == Some(message.task_id.as_str())
            && !run.consolidation_enqueued
        {
            warn!("运行 {} 的合并消息此前投递失败，重新投递", run_id);
            self.enqueue_consolidation(message, run.status).await?;
            return Ok(CompletionOutcome::ConsolidationRecovered(run.status));
        }

        debug!("运行 {} 的终态已由其他节点写入", run_id);
        Ok(CompletionOutcome::AlreadyClaimed(run.status))
    }

    async fn enqueue_consolidation(
        &self,
        message: &DispatchMessage,
        outcome: RunStatus,
    ) -> PipelineResult<()> {
        let queue = message.consolidation_queue_address.as_str();
        let consolidation = Message::consolidation(message.consolidation_message());
        self.retry
            .run("enqueue_consolidation", || self.queue.enqueue(queue, &consolidation))
            .await?;
        self.tracker.mark_consolidation_enqueued(&message.run_id).await?;
        metrics::counter!("hca_consolidations_enqueued_total", "outcome" => outcome.as_str())
            .increment(1);
        info!(
            "运行 {} 已结束 ({})，合并消息已投递到 {}",
            message.run_id, outcome, queue
        );
        Ok(())
    }
}
