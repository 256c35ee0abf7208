//! 测试替身
//!
//! 包装真实的内存实现，按需注入失败并记录调用，供单元测试和集成测试使用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hca_domain::{
    AnalysisRequest, AnalysisTool, BlobStore, Delivery, ListResult, Message, MessageQueue,
    QueueDepth, ReceiptHandle, Run, RunStatus, StatusStore, Task, TaskKey, TaskStatus, ToolExit,
    SENTINEL_COMPLETE,
};
use hca_errors::{PipelineError, PipelineResult};

/// 脚本化分析工具对某个任务的行为
#[derive(Debug, Clone)]
pub enum ToolScript {
    /// 写出输出文件 `(相对路径, 内容)` 和 `Complete` 哨兵，内容中的 `{task_id}` 会被替换
    Succeed(Vec<(String, String)>),
    /// 正常退出但不写哨兵
    NoSentinel,
    /// 写入首行不是 `Complete` 的哨兵
    Incomplete,
    /// 工具无法启动
    LaunchError,
}

/// 按任务ID返回预设结果的分析工具
#[derive(Debug, Clone)]
pub struct ScriptedAnalysisTool {
    default_script: ToolScript,
    scripts: Arc<Mutex<HashMap<String, ToolScript>>>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAnalysisTool {
    pub fn new(default_script: ToolScript) -> Self {
        Self {
            default_script,
            scripts: Arc::new(Mutex::new(HashMap::new())),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 默认为每个任务写出一个 `measurements.csv`
    pub fn succeeding() -> Self {
        Self::new(ToolScript::Succeed(vec![(
            "measurements.csv".to_string(),
            "Well,Count\n{task_id},1\n".to_string(),
        )]))
    }

    pub fn with_script(self, task_id: &str, script: ToolScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), script);
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self, task_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }

    fn script_for(&self, task_id: &str) -> ToolScript {
        self.scripts
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

#[async_trait]
impl AnalysisTool for ScriptedAnalysisTool {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &AnalysisRequest) -> PipelineResult<ToolExit> {
        self.invocations
            .lock()
            .unwrap()
            .push(request.task_id.clone());

        // 工作节点必须先把输入下载到本地
        for input in [&request.rowset_path, &request.pipeline_path] {
            if !input.exists() {
                return Err(PipelineError::analysis_failure(format!(
                    "输入文件不存在: {}",
                    input.display()
                )));
            }
        }

        match self.script_for(&request.task_id) {
            ToolScript::Succeed(outputs) => {
                for (relative, content) in outputs {
                    let path = request.output_dir.join(&relative);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, content.replace("{task_id}", &request.task_id))
                        .await?;
                }
                tokio::fs::write(&request.sentinel_path, format!("{SENTINEL_COMPLETE}\n")).await?;
                Ok(ToolExit {
                    exit_code: Some(0),
                    success: true,
                })
            }
            ToolScript::NoSentinel => Ok(ToolExit {
                exit_code: Some(0),
                success: true,
            }),
            ToolScript::Incomplete => {
                tokio::fs::write(&request.sentinel_path, "Error\n").await?;
                Ok(ToolExit {
                    exit_code: Some(1),
                    success: false,
                })
            }
            ToolScript::LaunchError => Err(PipelineError::analysis_failure("工具无法启动")),
        }
    }
}

/// 在指定次数内返回可重试存储错误的对象存储
pub struct FlakyBlobStore {
    inner: Arc<dyn BlobStore>,
    get_failures: AtomicU32,
    put_failures: AtomicU32,
    failing_key_fragment: Mutex<Option<String>>,
    calls: AtomicU32,
}

impl FlakyBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            get_failures: AtomicU32::new(0),
            put_failures: AtomicU32::new(0),
            failing_key_fragment: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_transient_get_failures(self, count: u32) -> Self {
        self.get_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_transient_put_failures(self, count: u32) -> Self {
        self.put_failures.store(count, Ordering::SeqCst);
        self
    }

    /// 键中包含该片段的读写一律失败
    pub fn with_failing_key(self, fragment: &str) -> Self {
        *self.failing_key_fragment.lock().unwrap() = Some(fragment.to_string());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, counter: &AtomicU32, key: &str) -> PipelineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fragment) = self.failing_key_fragment.lock().unwrap().as_deref() {
            if key.contains(fragment) {
                return Err(PipelineError::storage_error(format!("injected failure: {key}")));
            }
        }
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::storage_error("503 Slow Down"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> PipelineResult<ListResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list(bucket, prefix, recursive).await
    }

    async fn get(&self, bucket: &str, key: &str) -> PipelineResult<Vec<u8>> {
        self.check(&self.get_failures, key)?;
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> PipelineResult<()> {
        self.check(&self.put_failures, key)?;
        self.inner.put(bucket, key, body).await
    }
}

fn run_status_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Scheduled => 0,
        RunStatus::Running => 1,
        RunStatus::Finished | RunStatus::Failed => 2,
    }
}

/// `observed` 是否为 Scheduled, Running, {Finished|Failed} 的子序列，
/// 用于检查 [`RecordingStatusStore::run_history`]
pub fn is_monotonic_history(observed: &[RunStatus]) -> bool {
    let mut terminal: Option<RunStatus> = None;
    observed
        .windows(2)
        .all(|pair| run_status_rank(pair[0]) <= run_status_rank(pair[1]))
        && observed.iter().filter(|s| s.is_terminal()).all(|s| {
            let first = *terminal.get_or_insert(*s);
            first == *s
        })
}

/// 记录每次生效的运行状态变化，并可注入任务状态写入失败
pub struct RecordingStatusStore {
    inner: Arc<dyn StatusStore>,
    run_history: Mutex<HashMap<String, Vec<RunStatus>>>,
    run_update_lock: tokio::sync::Mutex<()>,
    task_update_failures: AtomicU32,
}

impl RecordingStatusStore {
    pub fn new(inner: Arc<dyn StatusStore>) -> Self {
        Self {
            inner,
            run_history: Mutex::new(HashMap::new()),
            run_update_lock: tokio::sync::Mutex::new(()),
            task_update_failures: AtomicU32::new(0),
        }
    }

    pub fn with_task_update_failures(self, count: u32) -> Self {
        self.task_update_failures.store(count, Ordering::SeqCst);
        self
    }

    /// 运行自登记起经历的所有状态
    pub fn run_history(&self, run_id: &str) -> Vec<RunStatus> {
        self.run_history
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusStore for RecordingStatusStore {
    async fn create_run(&self, run: &Run) -> PipelineResult<bool> {
        let created = self.inner.create_run(run).await?;
        if created {
            self.run_history
                .lock()
                .unwrap()
                .insert(run.run_id.clone(), vec![run.status]);
        }
        Ok(created)
    }

    async fn get_run(&self, run_id: &str) -> PipelineResult<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn put_task(&self, task: &Task) -> PipelineResult<()> {
        self.inner.put_task(task).await
    }

    async fn get_task(&self, key: &TaskKey) -> PipelineResult<Option<Task>> {
        self.inner.get_task(key).await
    }

    async fn query_tasks(&self, run_id: &str) -> PipelineResult<Vec<Task>> {
        self.inner.query_tasks(run_id).await
    }

    async fn update_run_status_if(
        &self,
        run_id: &str,
        expected: RunStatus,
        new_status: RunStatus,
    ) -> PipelineResult<bool> {
        // 条件写和记录在同一把锁内完成，记录顺序即生效顺序
        let _guard = self.run_update_lock.lock().await;
        let applied = self
            .inner
            .update_run_status_if(run_id, expected, new_status)
            .await?;
        if applied {
            self.run_history
                .lock()
                .unwrap()
                .entry(run_id.to_string())
                .or_default()
                .push(new_status);
        }
        Ok(applied)
    }

    async fn complete_run_if_running(
        &self,
        run_id: &str,
        outcome: RunStatus,
        task_id: &str,
    ) -> PipelineResult<bool> {
        let _guard = self.run_update_lock.lock().await;
        let applied = self
            .inner
            .complete_run_if_running(run_id, outcome, task_id)
            .await?;
        if applied {
            self.run_history
                .lock()
                .unwrap()
                .entry(run_id.to_string())
                .or_default()
                .push(outcome);
        }
        Ok(applied)
    }

    async fn mark_consolidation_enqueued(&self, run_id: &str) -> PipelineResult<bool> {
        self.inner.mark_consolidation_enqueued(run_id).await
    }

    async fn update_task_status_if(
        &self,
        key: &TaskKey,
        expected: TaskStatus,
        new_status: TaskStatus,
    ) -> PipelineResult<bool> {
        let remaining = self.task_update_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.task_update_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::StatusStore("injected failure".to_string()));
        }
        self.inner
            .update_task_status_if(key, expected, new_status)
            .await
    }
}

/// 可注入入队和确认失败的消息队列包装
pub struct FaultyMessageQueue {
    inner: Arc<dyn MessageQueue>,
    enqueue_failures: Mutex<HashMap<String, u32>>,
    ack_failures: AtomicU32,
    acknowledged: Mutex<Vec<String>>,
}

impl FaultyMessageQueue {
    pub fn new(inner: Arc<dyn MessageQueue>) -> Self {
        Self {
            inner,
            enqueue_failures: Mutex::new(HashMap::new()),
            ack_failures: AtomicU32::new(0),
            acknowledged: Mutex::new(Vec::new()),
        }
    }

    pub fn with_enqueue_failures(self, queue: &str, count: u32) -> Self {
        self.enqueue_failures
            .lock()
            .unwrap()
            .insert(queue.to_string(), count);
        self
    }

    pub fn with_ack_failures(self, count: u32) -> Self {
        self.ack_failures.store(count, Ordering::SeqCst);
        self
    }

    /// 成功确认的消息所在队列
    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageQueue for FaultyMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> PipelineResult<()> {
        {
            let mut failures = self.enqueue_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(queue) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PipelineError::queue_error(format!(
                        "injected enqueue failure: {queue}"
                    )));
                }
            }
        }
        self.inner.enqueue(queue, message).await
    }

    async fn receive(&self, queue: &str, wait: Duration) -> PipelineResult<Option<Delivery>> {
        self.inner.receive(queue, wait).await
    }

    async fn acknowledge(&self, queue: &str, receipt: &ReceiptHandle) -> PipelineResult<()> {
        let remaining = self.ack_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.ack_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::queue_error("injected ack failure"));
        }
        self.inner.acknowledge(queue, receipt).await?;
        self.acknowledged.lock().unwrap().push(queue.to_string());
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> PipelineResult<()> {
        self.inner.change_visibility(queue, receipt, timeout).await
    }

    async fn depth(&self, queue: &str) -> PipelineResult<QueueDepth> {
        self.inner.depth(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_history() {
        use RunStatus::*;
        assert!(is_monotonic_history(&[Scheduled, Running, Finished]));
        assert!(is_monotonic_history(&[Scheduled, Scheduled, Running]));
        assert!(is_monotonic_history(&[Running, Failed, Failed]));
        assert!(is_monotonic_history(&[]));
        assert!(!is_monotonic_history(&[Running, Scheduled]));
        assert!(!is_monotonic_history(&[Running, Finished, Failed]));
    }
}
