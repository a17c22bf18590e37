//! # taskpool-dispatcher
//!
//! 任务分发与Worker池编排：
//!
//! - [`TaskQueue`] - 任务排队与比较并交换的状态修改
//! - [`WorkerRegistry`] - Worker注册表与每个Worker的互斥区
//! - [`HealthMonitor`] - 周期性健康检查，降级与恢复Worker
//! - [`PerformanceTracker`] - 执行指标与性能系数
//! - [`Dispatcher`] - 按有效评分分配任务，处理结果、重试、超时与Worker失效
//! - [`PoolManager`] - 本地Worker进程的扩缩容
//! - [`TaskController`] - 对外的控制入口

pub mod controller;
pub mod dispatcher;
pub mod health_monitor;
pub mod performance_tracker;
pub mod pool_manager;
pub mod retry_service;
pub mod strategies;
pub mod task_queue;
pub mod worker_registry;

pub use controller::TaskController;
pub use dispatcher::{Dispatcher, ScheduleReport};
pub use health_monitor::{HealthMonitor, WorkerFailureHandler};
pub use performance_tracker::{PerformanceState, PerformanceTracker};
pub use pool_manager::{PoolManager, PoolSnapshot, PoolState, ScalingAction};
pub use retry_service::{RetryDecision, RetryPolicy};
pub use strategies::*;
pub use task_queue::TaskQueue;
pub use worker_registry::WorkerRegistry;
