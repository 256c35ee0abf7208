pub mod blob_store;
pub mod database;
pub mod factory;
pub mod in_memory_queue;
pub mod message_queue;
pub mod retry_wrapper;
pub mod scratch;

pub use blob_store::{InMemoryBlobStore, LocalFsBlobStore};
pub use database::{InMemoryStatusStore, SqliteStatusStore};
pub use factory::{BlobStoreFactory, MessageQueueFactory, StatusStoreFactory};
pub use in_memory_queue::InMemoryMessageQueue;
pub use message_queue::RabbitMQMessageQueue;
pub use retry_wrapper::{RetryPolicy, RetryingBlobStore};
pub use scratch::ScratchArea;
