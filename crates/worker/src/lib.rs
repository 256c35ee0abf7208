//! 工作节点
//!
//! 从分发队列逐条取出任务，调用分析工具，上传结果并更新任务状态，
//! 最后检查整个运行是否完成。

pub mod analysis;
pub mod completion;
pub mod processor;
pub mod service;

pub use analysis::CellProfilerTool;
pub use completion::{CompletionDetector, CompletionOutcome};
pub use processor::{TaskProcessor, TaskReport};
pub use service::{WorkerLoop, WorkerLoopBuilder, WorkerSummary};
