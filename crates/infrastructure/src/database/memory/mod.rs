//! 进程内存储
//!
//! 以ID为键的表，由锁保护。语义与SQLite实现保持一致，
//! 用于单进程部署和测试。

pub mod memory_metric_repository;
pub mod memory_task_repository;
pub mod memory_worker_repository;

pub use memory_metric_repository::InMemoryWorkerMetricRepository;
pub use memory_task_repository::InMemoryTaskRepository;
pub use memory_worker_repository::InMemoryWorkerRepository;
