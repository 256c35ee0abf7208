use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use hca_config::{AppConfig, ConsumerMode};
use hca_consolidator::{ConsolidatorLoop, ConsolidatorSummary};
use hca_dispatcher::{DispatchReport, JobSubmitter, SubmissionRequest};
use hca_domain::{AnalysisTool, BlobStore, MessageQueue, StatusStore, StatusTracker};
use hca_infrastructure::{BlobStoreFactory, MessageQueueFactory, StatusStoreFactory};
use hca_worker::{CellProfilerTool, WorkerLoop, WorkerSummary};
use tokio::sync::broadcast;
use tracing::info;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 提交一个作业后退出
    Submit,
    Worker,
    Consolidator,
    /// 同一进程内提交并运行若干工作节点和一个合并器
    All,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submit" => Ok(AppMode::Submit),
            "worker" => Ok(AppMode::Worker),
            "consolidator" => Ok(AppMode::Consolidator),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 一次运行的汇总
#[derive(Debug, Default)]
pub struct AppReport {
    pub dispatch: Option<DispatchReport>,
    pub workers: Vec<WorkerSummary>,
    pub consolidator: Option<ConsolidatorSummary>,
}

/// 主应用程序
pub struct Application {
    config: Arc<AppConfig>,
    mode: AppMode,
    queue: Arc<dyn MessageQueue>,
    status_store: Arc<dyn StatusStore>,
    blob_store: Arc<dyn BlobStore>,
    tool: Arc<dyn AnalysisTool>,
    request: Option<PathBuf>,
    workers: usize,
}

impl Application {
    /// 按配置创建队列、状态存储和对象存储
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let queue = MessageQueueFactory::create(&config.message_queue)
            .await
            .context("创建消息队列失败")?;
        let status_store = StatusStoreFactory::create(&config.status_store)
            .await
            .context("创建状态存储失败")?;
        let blob_store = BlobStoreFactory::create(&config.storage, &config.resilience);

        Ok(Self::from_parts(
            Arc::new(config),
            mode,
            queue,
            status_store,
            blob_store,
        ))
    }

    /// 使用已构造好的组件，嵌入其他进程或测试时使用
    pub fn from_parts(
        config: Arc<AppConfig>,
        mode: AppMode,
        queue: Arc<dyn MessageQueue>,
        status_store: Arc<dyn StatusStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        let tool: Arc<dyn AnalysisTool> =
            Arc::new(CellProfilerTool::new(&config.worker.analysis_tool));
        Self {
            config,
            mode,
            queue,
            status_store,
            blob_store,
            tool,
            request: None,
            workers: 1,
        }
    }

    pub fn with_request(mut self, request: impl Into<PathBuf>) -> Self {
        self.request = Some(request.into());
        self
    }

    /// 仅在 all 模式下生效
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn AnalysisTool>) -> Self {
        self.tool = tool;
        self
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行应用程序
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<AppReport> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let mut report = AppReport::default();
        match self.mode {
            AppMode::Submit => {
                report.dispatch = Some(self.submit().await?);
            }
            AppMode::Worker => {
                let worker = self.worker(self.config.worker.worker_id.clone());
                report.workers.push(worker.run(shutdown_rx).await);
            }
            AppMode::Consolidator => {
                report.consolidator = Some(self.consolidator().run(shutdown_rx).await);
            }
            AppMode::All => {
                if self.request.is_some() {
                    report.dispatch = Some(self.submit().await?);
                }
                let (workers, consolidator) = self.run_all_components(shutdown_rx).await;
                report.workers = workers;
                report.consolidator = Some(consolidator);
            }
        }

        info!("应用程序运行结束");
        Ok(report)
    }

    async fn submit(&self) -> Result<DispatchReport> {
        let path = self
            .request
            .as_ref()
            .context("submit 模式需要 --request 指定提交请求文件")?;
        let request = SubmissionRequest::from_file(path)
            .await
            .with_context(|| format!("读取提交请求失败: {}", path.display()))?;

        let submitter = JobSubmitter::new(
            self.config.clone(),
            self.blob_store.clone(),
            self.tracker(),
            self.queue.clone(),
        );
        let report = submitter.submit(request).await.context("提交作业失败")?;
        info!(
            "运行 {} 已提交，共 {} 个任务",
            report.run_id,
            report.task_ids.len()
        );
        Ok(report)
    }

    /// 每个工作节点是一个独立的顺序循环，只在实例之间并行
    async fn run_all_components(
        &self,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Vec<WorkerSummary>, ConsolidatorSummary) {
        info!("启动 {} 个工作节点和 1 个合并器", self.workers);

        let workers: Vec<WorkerLoop> = (0..self.workers)
            .map(|index| self.worker(format!("{}-{}", self.config.worker.worker_id, index)))
            .collect();
        let consolidator = self.consolidator();

        let worker_runs = join_all(
            workers
                .iter()
                .map(|worker| worker.run(shutdown_rx.resubscribe())),
        );

        match self.config.consolidator.mode {
            // 批处理模式下合并队列要等所有任务结束后才会有消息
            ConsumerMode::Batch => {
                let summaries = worker_runs.await;
                let consolidated = consolidator.run(shutdown_rx).await;
                (summaries, consolidated)
            }
            ConsumerMode::LongPoll => tokio::join!(worker_runs, consolidator.run(shutdown_rx)),
        }
    }

    fn tracker(&self) -> StatusTracker {
        StatusTracker::new(self.status_store.clone())
    }

    fn worker(&self, worker_id: String) -> WorkerLoop {
        WorkerLoop::builder(
            worker_id,
            self.queue.clone(),
            self.blob_store.clone(),
            self.tracker(),
            self.tool.clone(),
        )
        .with_config(&self.config)
        .build()
    }

    fn consolidator(&self) -> ConsolidatorLoop {
        ConsolidatorLoop::builder(
            format!("{}-consolidator", self.config.worker.worker_id),
            self.queue.clone(),
            self.blob_store.clone(),
        )
        .with_config(&self.config)
        .build()
    }
}
