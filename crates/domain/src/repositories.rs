//! 状态存储抽象
//!
//! 运行与任务记录的点读写、按运行查询任务，以及条件更新（CAS）。

use async_trait::async_trait;
use hca_errors::PipelineResult;

use crate::entities::{Run, RunStatus, Task, TaskKey, TaskStatus};

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 仅当运行ID不存在时写入；已存在返回 `Ok(false)`，不覆盖原记录
    async fn create_run(&self, run: &Run) -> PipelineResult<bool>;
    async fn get_run(&self, run_id: &str) -> PipelineResult<Option<Run>>;

    async fn put_task(&self, task: &Task) -> PipelineResult<()>;
    async fn get_task(&self, key: &TaskKey) -> PipelineResult<Option<Task>>;
    async fn query_tasks(&self, run_id: &str) -> PipelineResult<Vec<Task>>;

    /// 仅当当前状态等于 `expected` 时写入 `new`；条件不满足返回 `Ok(false)`
    async fn update_run_status_if(
        &self,
        run_id: &str,
        expected: RunStatus,
        new: RunStatus,
    ) -> PipelineResult<bool>;

    /// Running → `outcome`，同时记下写入终态的任务
    async fn complete_run_if_running(
        &self,
        run_id: &str,
        outcome: RunStatus,
        task_id: &str,
    ) -> PipelineResult<bool>;

    /// 合并消息投递成功后置位，已置位返回 `Ok(false)`
    async fn mark_consolidation_enqueued(&self, run_id: &str) -> PipelineResult<bool>;

    async fn update_task_status_if(
        &self,
        key: &TaskKey,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> PipelineResult<bool>;
}
