pub mod mapping;
pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryTaskRepository, InMemoryWorkerMetricRepository, InMemoryWorkerRepository};
pub use sqlite::{
    DatabaseManager, SqliteTaskRepository, SqliteWorkerMetricRepository, SqliteWorkerRepository,
};
