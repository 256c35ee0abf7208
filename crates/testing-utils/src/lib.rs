//! # HCA Testing Utils
//!
//! 各 crate 共用的测试替身和测试辅助：
//!
//! - **Builders**: 元数据文档和运行记录构造器
//! - **Mocks**: 脚本化分析工具、会失败的存储/队列、记录状态变化的状态存储
//! - **Containers**: 临时目录中的 SQLite 状态存储
//! - **Helpers**: 全内存的流水线组件组合
//!
//! ```toml
//! [dev-dependencies]
//! hca-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
