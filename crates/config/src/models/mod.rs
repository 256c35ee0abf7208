pub mod app_config;
pub mod dispatcher_worker;
pub mod logging;
pub mod message_queue;
pub mod resilience;
pub mod storage;

pub use app_config::*;
pub use dispatcher_worker::*;
pub use logging::*;
pub use message_queue::*;
pub use resilience::*;
pub use storage::*;
