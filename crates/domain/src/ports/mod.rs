pub mod analysis;
pub mod messaging;
pub mod storage;

pub use analysis::*;
pub use messaging::*;
pub use storage::*;
