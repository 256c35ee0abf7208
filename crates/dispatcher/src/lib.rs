//! 作业分发
//!
//! 把一次图像分析作业拆分为按孔划分的任务：解析元数据、写入每个孔的
//! 图像清单、登记任务并投递到分发队列。

pub mod metadata;
pub mod submission;
pub mod task_dispatcher;

pub use metadata::{ImageRecord, ImageRow, MetadataSplitter, WellPartition};
pub use submission::{DispatchReport, JobSubmitter, SubmissionRequest};
pub use task_dispatcher::TaskDispatcher;
