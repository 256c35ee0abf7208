use std::collections::HashMap;

use async_trait::async_trait;
use hca_domain::{touch, Run, RunStatus, StatusStore, Task, TaskKey, TaskStatus};
use hca_errors::PipelineResult;
use tokio::sync::RwLock;
use tracing::debug;

/// 内存状态存储，条件更新在写锁内完成比较与写入
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    runs: RwLock<HashMap<String, Run>>,
    tasks: RwLock<HashMap<TaskKey, Task>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn create_run(&self, run: &Run) -> PipelineResult<bool> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Ok(false);
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(true)
    }

    async fn get_run(&self, run_id: &str) -> PipelineResult<Option<Run>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn put_task(&self, task: &Task) -> PipelineResult<()> {
        self.tasks.write().await.insert(task.key(), task.clone());
        Ok(())
    }

    async fn get_task(&self, key: &TaskKey) -> PipelineResult<Option<Task>> {
        Ok(self.tasks.read().await.get(key).cloned())
    }

    async fn query_tasks(&self, run_id: &str) -> PipelineResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|task| task.run_id == run_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(result)
    }

    async fn update_run_status_if(
        &self,
        run_id: &str,
        expected: RunStatus,
        new: RunStatus,
    ) -> PipelineResult<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(run) if run.status == expected => {
                run.status = new;
                Ok(true)
            }
            Some(run) => {
                debug!(
                    "运行 {} 条件更新未生效: 期望 {}，实际 {}",
                    run_id, expected, run.status
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn complete_run_if_running(
        &self,
        run_id: &str,
        outcome: RunStatus,
        task_id: &str,
    ) -> PipelineResult<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = outcome;
                run.completed_by = Some(task_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_consolidation_enqueued(&self, run_id: &str) -> PipelineResult<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(run) if !run.consolidation_enqueued => {
                run.consolidation_enqueued = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_task_status_if(
        &self,
        key: &TaskKey,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> PipelineResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(key) {
            Some(task) if task.status == expected => {
                task.status = new;
                touch(task);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
