use std::str::FromStr;

use chrono::{DateTime, Utc};
use hca_errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

use crate::value_objects::{BlobLocation, BlobObject, RunRecordLayout};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed)
    }

    /// 状态只能沿 Scheduled → Running → {Finished, Failed} 前进
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Scheduled, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Finished)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(RunStatus::Scheduled),
            "RUNNING" => Ok(RunStatus::Running),
            "FINISHED" => Ok(RunStatus::Finished),
            "FAILED" => Ok(RunStatus::Failed),
            _ => Err(PipelineError::StatusStore(format!("无效的运行状态: {s}"))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Scheduled)
    }
}

impl FromStr for TaskStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(TaskStatus::Scheduled),
            "FINISHED" => Ok(TaskStatus::Finished),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(PipelineError::StatusStore(format!("无效的任务状态: {s}"))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 根据一次运行的全部任务状态得出的进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunProgress {
    /// 仍有任务处于 Scheduled
    Incomplete { scheduled: usize },
    /// 所有任务均已终结，携带运行的最终状态
    Complete(RunStatus),
}

impl RunProgress {
    pub fn from_task_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut scheduled = 0;
        let mut any_failed = false;
        for status in statuses {
            match status {
                TaskStatus::Scheduled => scheduled += 1,
                TaskStatus::Failed => any_failed = true,
                TaskStatus::Finished => {}
            }
        }

        if scheduled > 0 {
            RunProgress::Incomplete { scheduled }
        } else if any_failed {
            RunProgress::Complete(RunStatus::Failed)
        } else {
            RunProgress::Complete(RunStatus::Finished)
        }
    }
}

/// 一次提交的分析作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub submitted_by: String,
    pub submit_timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub image_data: BlobLocation,
    pub pipeline: BlobObject,
    pub record_location: BlobLocation,
    /// 写入终态的任务，由它负责投递合并消息
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub consolidation_enqueued: bool,
}

impl Run {
    /// 创建处于 Scheduled 状态的运行记录，构造时校验必填字段
    pub fn new(
        run_id: impl Into<String>,
        submitted_by: impl Into<String>,
        submit_timestamp: DateTime<Utc>,
        image_data: BlobLocation,
        pipeline: BlobObject,
        record_location: BlobLocation,
    ) -> PipelineResult<Self> {
        let run = Self {
            run_id: run_id.into(),
            submitted_by: submitted_by.into(),
            submit_timestamp,
            status: RunStatus::Scheduled,
            image_data,
            pipeline,
            record_location,
            completed_by: None,
            consolidation_enqueued: false,
        };
        run.validate()?;
        Ok(run)
    }

    /// 默认运行ID: `{submitted_by}_{毫秒时间戳}`
    pub fn generate_run_id(submitted_by: &str, submit_timestamp: DateTime<Utc>) -> String {
        format!("{}_{}", submitted_by, submit_timestamp.timestamp_millis())
    }

    fn validate(&self) -> PipelineResult<()> {
        let required = [
            ("run_id", self.run_id.as_str()),
            ("submitted_by", self.submitted_by.as_str()),
            ("image_data.bucket", self.image_data.bucket.as_str()),
            ("pipeline.bucket", self.pipeline.bucket.as_str()),
            ("pipeline.key", self.pipeline.key.as_str()),
            ("record_location.bucket", self.record_location.bucket.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(PipelineError::validation_error(format!(
                    "运行记录字段 {field} 不能为空"
                )));
            }
        }
        if self.run_id.contains('/') {
            return Err(PipelineError::validation_error(format!(
                "运行ID不能包含 '/': {}",
                self.run_id
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> RunRecordLayout {
        RunRecordLayout::new(&self.record_location, &self.run_id)
    }
}

/// 任务主键 `(run_id, task_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub run_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.task_id)
    }
}

/// 一个分析单元（一个孔）对应的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub run_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub input_rowset: BlobObject,
    pub output_prefix: String,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 为运行中的某个孔创建 Scheduled 任务，task_id 即孔标签
    pub fn scheduled(run: &Run, well: &str) -> PipelineResult<Self> {
        if well.trim().is_empty() {
            return Err(PipelineError::validation_error("孔标签不能为空"));
        }
        let layout = run.layout();
        Ok(Self {
            run_id: run.run_id.clone(),
            task_id: well.to_string(),
            status: TaskStatus::Scheduled,
            input_rowset: layout.task_input_rowset(well),
            output_prefix: layout.task_output_prefix(well),
            updated_at: Utc::now(),
        })
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.run_id.clone(), self.task_id.clone())
    }
}
