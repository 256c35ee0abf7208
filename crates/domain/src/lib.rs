pub mod entities;
pub mod messaging;
pub mod ports;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use hca_errors::{PipelineError, PipelineResult};
pub use messaging::*;
pub use ports::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
