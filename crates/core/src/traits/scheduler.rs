use async_trait::async_trait;

use crate::{
    models::{Task, WorkerInfo},
    SchedulerResult,
};

/// 任务分派策略接口
#[async_trait]
pub trait TaskDispatchStrategy: Send + Sync {
    /// 从候选Worker中选择一个执行任务，没有合适的Worker时返回 `None`
    async fn select_worker(
        &self,
        task: &Task,
        available_workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>>;

    /// 获取策略名称
    fn name(&self) -> &str;
}
