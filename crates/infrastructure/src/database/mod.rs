mod in_memory;
mod sqlite;

pub use in_memory::InMemoryStatusStore;
pub use sqlite::SqliteStatusStore;
