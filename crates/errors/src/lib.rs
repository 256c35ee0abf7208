use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("状态存储错误: {0}")]
    StatusStore(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("元数据解析失败: {0}")]
    MetadataParse(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("存储对象未找到: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("运行记录未找到: {run_id}")]
    RunNotFound { run_id: String },
    #[error("任务记录未找到: {run_id}/{task_id}")]
    TaskNotFound { run_id: String, task_id: String },
    #[error("分析工具执行失败: {0}")]
    AnalysisFailure(String),
    #[error("结果合并失败: {0}")]
    Consolidation(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("IO错误: {0}")]
    Io(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn metadata_parse<S: Into<String>>(msg: S) -> Self {
        Self::MetadataParse(msg.into())
    }
    pub fn storage_error<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn object_not_found<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self::ObjectNotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
    pub fn queue_error<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn run_not_found<S: Into<String>>(run_id: S) -> Self {
        Self::RunNotFound {
            run_id: run_id.into(),
        }
    }
    pub fn task_not_found<R: Into<String>, T: Into<String>>(run_id: R, task_id: T) -> Self {
        Self::TaskNotFound {
            run_id: run_id.into(),
            task_id: task_id.into(),
        }
    }
    pub fn analysis_failure<S: Into<String>>(msg: S) -> Self {
        Self::AnalysisFailure(msg.into())
    }
    pub fn consolidation_error<S: Into<String>>(msg: S) -> Self {
        Self::Consolidation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 中止整个提交流程的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::ValidationError(_)
                | PipelineError::MetadataParse(_)
                | PipelineError::Configuration(_)
                | PipelineError::Internal(_)
        )
    }

    /// 可以在调用点有限次重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Storage(_)
                | PipelineError::Io(_)
                | PipelineError::MessageQueue(_)
                | PipelineError::StatusStore(_)
                | PipelineError::Timeout(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            PipelineError::ValidationError(_) => "提交的数据未通过验证",
            PipelineError::MetadataParse(_) => "元数据文件格式有误",
            PipelineError::RunNotFound { .. } => "请求的运行记录不存在",
            PipelineError::TaskNotFound { .. } => "请求的任务记录不存在",
            PipelineError::ObjectNotFound { .. } => "请求的存储对象不存在",
            PipelineError::AnalysisFailure(_) => "图像分析未成功完成",
            PipelineError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Consolidation(format!("CSV处理失败: {err}"))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}
