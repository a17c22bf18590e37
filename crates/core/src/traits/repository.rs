//! 数据仓储层接口定义
//!
//! - 任务仓储接口 (TaskRepository)
//! - Worker仓储接口 (WorkerRepository)
//! - Worker指标仓储接口 (WorkerMetricRepository)
//!
//! ## 设计原则
//!
//! 仓储只提供按字段划分的写操作，没有"整行覆盖"的接口：
//! 任务状态只能通过 [`TaskRepository::transition`] 以比较并交换的方式修改，
//! Worker 的健康字段、性能系数、在途任务数分别由不同的组件写入。
//! 多个分发器实例共享同一存储时，正确性依赖于这些原子操作。
//!
//! 查询语句显式列出所需的列，表结构增加新列时无需修改实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Task, TaskFilter, TaskStatusSummary, TaskTransition, WorkerHealthUpdate, WorkerInfo,
    WorkerMetric, WorkerStatus,
};
use crate::SchedulerResult;

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 持久化新任务
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    /// 根据ID获取任务
    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;

    /// 以比较并交换的方式应用状态转换
    ///
    /// 任务当前状态（以及 `expected_attempt`）与转换的前置条件不符时返回 `Ok(false)`；
    /// 转换本身不被状态机允许时返回 `InvalidTaskTransition`。
    async fn transition(&self, id: &str, transition: &TaskTransition) -> SchedulerResult<bool>;

    /// 为未结束的任务设置取消标记，任务已结束时返回 `false`
    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> SchedulerResult<bool>;

    /// 获取可分配的待处理任务
    ///
    /// 按优先级降序、创建时间升序排列，跳过仍在退避期内的任务。
    async fn get_pending_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Task>>;

    /// 按条件查询任务
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    /// 各状态的任务数量
    async fn count_by_status(&self) -> SchedulerResult<TaskStatusSummary>;
}

/// Worker仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册Worker
    ///
    /// 同ID的Worker仍在册（非 DEAD / REMOVED）时返回 `false` 且不做任何修改。
    async fn register(&self, worker: &WorkerInfo) -> SchedulerResult<bool>;

    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<WorkerInfo>>;

    /// 列出所有未注销的Worker
    async fn list(&self) -> SchedulerResult<Vec<WorkerInfo>>;

    async fn get_by_status(&self, status: WorkerStatus) -> SchedulerResult<Vec<WorkerInfo>>;

    /// 当前状态为 `from` 时切换到 `to`
    async fn update_status(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
    ) -> SchedulerResult<bool>;

    /// 写回健康检查结果，当前状态不是 `expected` 时返回 `false`
    async fn update_health(
        &self,
        worker_id: &str,
        expected: WorkerStatus,
        update: &WorkerHealthUpdate,
    ) -> SchedulerResult<bool>;

    async fn update_performance_factor(&self, worker_id: &str, factor: f64)
        -> SchedulerResult<()>;

    /// 调整在途任务数，结果不会小于0
    async fn adjust_task_count(&self, worker_id: &str, delta: i32) -> SchedulerResult<()>;

    async fn record_assignment(&self, worker_id: &str, at: DateTime<Utc>) -> SchedulerResult<()>;
}

/// Worker指标仓储接口
#[async_trait]
pub trait WorkerMetricRepository: Send + Sync {
    async fn insert(&self, metric: &WorkerMetric) -> SchedulerResult<()>;

    /// 某个Worker最近的指标，按测量时间降序
    async fn list_by_worker(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<WorkerMetric>>;

    /// 某个时间点之后的全部指标，按测量时间升序
    async fn list_since(&self, since: DateTime<Utc>) -> SchedulerResult<Vec<WorkerMetric>>;
}
