//! 高内涵图像分析作业的提交、分发和完成跟踪
//!
//! 二进制入口见 `main.rs`；这里暴露应用装配和关闭管理，供嵌入式运行和端到端测试使用。

pub mod app;
pub mod logging;
pub mod shutdown;

pub use app::{AppMode, AppReport, Application};
pub use shutdown::ShutdownManager;
