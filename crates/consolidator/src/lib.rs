//! 结果合并
//!
//! 运行结束后消费合并队列：找出所有任务输出目录下的结果表，
//! 按文件名分组拼接成 `combined_*` 文件写回运行记录目录。

pub mod consolidator;
pub mod merge;
pub mod selection;
pub mod service;

pub use consolidator::{CombinedFile, ConsolidationReport, ResultConsolidator};
pub use merge::{CsvMerger, MergedTable};
pub use selection::{ExclusionRules, ResultSelection};
pub use service::{ConsolidatorLoop, ConsolidatorLoopBuilder, ConsolidatorSummary};
