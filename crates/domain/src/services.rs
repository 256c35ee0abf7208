//! # 状态跟踪服务
//!
//! 封装运行和任务的状态机规则，所有状态变更都通过条件写完成：
//!
//! - 运行状态只能沿 Scheduled → Running → {Finished, Failed} 前进
//! - 任务只能从 Scheduled 变为终态一次，先写入的终态生效
//!
//! 条件写失败（被其他节点抢先）以 `Ok(false)` 表达，不是错误。

use std::sync::Arc;

use chrono::Utc;
use hca_errors::{PipelineError, PipelineResult};
use tracing::{debug, info, instrument};

use crate::entities::{Run, RunStatus, Task, TaskKey, TaskStatus};
use crate::repositories::StatusStore;

/// 任务终结的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFinalization {
    Applied(TaskStatus),
    /// 任务此前已被终结（重复投递），保留原状态
    AlreadyTerminal(TaskStatus),
}

impl TaskFinalization {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskFinalization::Applied(status) | TaskFinalization::AlreadyTerminal(status) => {
                *status
            }
        }
    }
}

#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn register_run(&self, run: &Run) -> PipelineResult<()> {
        if run.status != RunStatus::Scheduled {
            return Err(PipelineError::validation_error(format!(
                "新运行必须处于 SCHEDULED 状态，当前为 {}",
                run.status
            )));
        }
        if !self.store.create_run(run).await? {
            return Err(PipelineError::validation_error(format!(
                "运行ID已存在: {}",
                run.run_id
            )));
        }
        info!("运行记录已创建: {}", run.run_id);
        Ok(())
    }

    #[instrument(skip(self, task), fields(run_id = %task.run_id, task_id = %task.task_id))]
    pub async fn register_task(&self, task: &Task) -> PipelineResult<()> {
        if task.status != TaskStatus::Scheduled {
            return Err(PipelineError::validation_error(format!(
                "新任务必须处于 SCHEDULED 状态，当前为 {}",
                task.status
            )));
        }
        self.store.put_task(task).await
    }

    pub async fn get_run(&self, run_id: &str) -> PipelineResult<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::run_not_found(run_id))
    }

    pub async fn query_tasks(&self, run_id: &str) -> PipelineResult<Vec<Task>> {
        self.store.query_tasks(run_id).await
    }

    /// 将任务标记为终态，重复调用是幂等的
    #[instrument(skip(self), fields(task = %key))]
    pub async fn finalize_task(
        &self,
        key: &TaskKey,
        outcome: TaskStatus,
    ) -> PipelineResult<TaskFinalization> {
        if !outcome.is_terminal() {
            return Err(PipelineError::validation_error(format!(
                "任务只能被标记为终态，收到 {outcome}"
            )));
        }

        if self
            .store
            .update_task_status_if(key, TaskStatus::Scheduled, outcome)
            .await?
        {
            debug!("任务 {} 已标记为 {}", key, outcome);
            return Ok(TaskFinalization::Applied(outcome));
        }

        let current = self
            .store
            .get_task(key)
            .await?
            .ok_or_else(|| PipelineError::task_not_found(&key.run_id, &key.task_id))?;
        debug!(
            "任务 {} 已处于终态 {}，忽略本次的 {}",
            key, current.status, outcome
        );
        Ok(TaskFinalization::AlreadyTerminal(current.status))
    }

    /// 条件迁移运行状态；非法迁移直接拒绝，竞争失败返回 `false`
    #[instrument(skip(self))]
    pub async fn try_transition_run(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> PipelineResult<bool> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::validation_error(format!(
                "非法的运行状态迁移: {from} -> {to}"
            )));
        }
        let applied = self.store.update_run_status_if(run_id, from, to).await?;
        if applied {
            info!("运行 {} 状态: {} -> {}", run_id, from, to);
        } else {
            debug!("运行 {} 的条件写未生效 ({} -> {})", run_id, from, to);
        }
        Ok(applied)
    }

    /// Running → `outcome`，胜出的任务记为合并消息的负责者
    #[instrument(skip(self))]
    pub async fn claim_completion(
        &self,
        run_id: &str,
        outcome: RunStatus,
        task_id: &str,
    ) -> PipelineResult<bool> {
        if !outcome.is_terminal() {
            return Err(PipelineError::validation_error(format!(
                "运行只能以终态结束，收到 {outcome}"
            )));
        }
        let applied = self
            .store
            .complete_run_if_running(run_id, outcome, task_id)
            .await?;
        if applied {
            info!("运行 {} 状态: RUNNING -> {}，由任务 {} 写入", run_id, outcome, task_id);
        }
        Ok(applied)
    }

    pub async fn mark_consolidation_enqueued(&self, run_id: &str) -> PipelineResult<bool> {
        self.store.mark_consolidation_enqueued(run_id).await
    }

    /// Scheduled → Running，已在运行或已结束时无操作
    pub async fn mark_run_running(&self, run_id: &str) -> PipelineResult<bool> {
        self.try_transition_run(run_id, RunStatus::Scheduled, RunStatus::Running)
            .await
    }
}

/// 构造任务记录时填充的更新时间
pub fn touch(task: &mut Task) {
    task.updated_at = Utc::now();
}
