use chrono::{DateTime, Utc};
use hca_errors::PipelineResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Run, Task, TaskKey};
use crate::value_objects::{BlobLocation, BlobObject};

/// 工作节点更新状态时使用的存储引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRefs {
    pub run_id: String,
    pub task: TaskKey,
}

/// 单个孔的分析任务消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub run_id: String,
    pub task_id: String,
    pub input_rowset_location: BlobObject,
    pub pipeline_location: BlobObject,
    pub output_prefix: String,
    pub status_store_refs: StatusRefs,
    pub consolidation_queue_address: String,
    pub run_record_bucket: String,
    pub sub_task_record_prefix: String,
    pub final_output_prefix: String,
    #[serde(default)]
    pub excluded_filename_patterns: Vec<String>,
    pub image_data: BlobLocation,
}

impl DispatchMessage {
    pub fn for_task(
        run: &Run,
        task: &Task,
        consolidation_queue_address: impl Into<String>,
        excluded_filename_patterns: Vec<String>,
    ) -> Self {
        let layout = run.layout();
        Self {
            run_id: run.run_id.clone(),
            task_id: task.task_id.clone(),
            input_rowset_location: task.input_rowset.clone(),
            pipeline_location: run.pipeline.clone(),
            output_prefix: task.output_prefix.clone(),
            status_store_refs: StatusRefs {
                run_id: run.run_id.clone(),
                task: task.key(),
            },
            consolidation_queue_address: consolidation_queue_address.into(),
            run_record_bucket: layout.bucket().to_string(),
            sub_task_record_prefix: layout.sub_task_record_prefix(),
            final_output_prefix: layout.final_output_prefix(),
            excluded_filename_patterns,
            image_data: run.image_data.clone(),
        }
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.status_store_refs.task
    }

    /// 运行完成后由唯一的胜出者发送的合并消息
    pub fn consolidation_message(&self) -> ConsolidationMessage {
        ConsolidationMessage {
            run_id: self.run_id.clone(),
            run_record_bucket: self.run_record_bucket.clone(),
            sub_task_record_prefix: self.sub_task_record_prefix.clone(),
            final_output_prefix: self.final_output_prefix.clone(),
            excluded_filename_patterns: self.excluded_filename_patterns.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationMessage {
    pub run_id: String,
    pub run_record_bucket: String,
    pub sub_task_record_prefix: String,
    pub final_output_prefix: String,
    #[serde(default)]
    pub excluded_filename_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    TaskDispatch(DispatchMessage),
    Consolidation(ConsolidationMessage),
}

/// 队列上传输的消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn task_dispatch(message: DispatchMessage) -> Self {
        let correlation_id = Some(message.run_id.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::TaskDispatch(message),
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn consolidation(message: ConsolidationMessage) -> Self {
        let correlation_id = Some(message.run_id.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::Consolidation(message),
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn run_id(&self) -> &str {
        match &self.message_type {
            MessageType::TaskDispatch(msg) => &msg.run_id,
            MessageType::Consolidation(msg) => &msg.run_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.message_type {
            MessageType::TaskDispatch(_) => "TaskDispatch",
            MessageType::Consolidation(_) => "Consolidation",
        }
    }

    pub fn serialize(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> PipelineResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 确认/归还消息时使用的句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一次接收到的消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub receipt: ReceiptHandle,
    /// 该消息被投递的次数（首次投递为 1）
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight
    }
}
