use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use taskpool_core::{
    models::{
        ExecutionMetrics, Task, TaskOutcome, TaskStatus, TaskStatusSummary, TaskSubmission,
        WorkerInfo, WorkerRegistration,
    },
    SchedulerError, SchedulerResult,
};

use crate::dispatcher::Dispatcher;
use crate::task_queue::TaskQueue;
use crate::worker_registry::WorkerRegistry;

/// 对外的任务与Worker控制入口
///
/// 传输层（HTTP、RPC等）只需要调用这里的方法。
pub struct TaskController {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
}

impl TaskController {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            queue: dispatcher.queue().clone(),
            registry: dispatcher.registry().clone(),
            dispatcher,
        }
    }

    /// 异步提交任务，返回任务ID
    pub async fn submit(&self, submission: TaskSubmission) -> SchedulerResult<String> {
        self.queue.enqueue(submission).await
    }

    /// 提交任务并等待其结束
    ///
    /// 等待时间以任务所有重试的超时和退避之和为上限，超出时返回 `ExecutionTimeout`，
    /// 任务本身继续执行。
    pub async fn submit_and_wait(&self, submission: TaskSubmission) -> SchedulerResult<Task> {
        let task_id = self.queue.enqueue(submission.synchronous()).await?;
        let mut completion = self.queue.subscribe_completion(&task_id).await;

        let task = self.queue.get(&task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let budget = self.dispatcher.wait_budget(&task);
        match timeout(budget, wait_for_terminal(&mut completion)).await {
            Ok(()) => self.queue.get(&task_id).await,
            Err(_) => {
                drop(completion);
                self.queue.release_completion(&task_id).await;
                warn!(task_id = %task_id, "同步等待超时 ({:?})", budget);
                Err(SchedulerError::ExecutionTimeout)
            }
        }
    }

    pub async fn get_status(&self, task_id: &str) -> SchedulerResult<Task> {
        self.queue.get(task_id).await
    }

    /// 取消任务，对已取消的任务重复调用也返回 `true`
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<bool> {
        self.dispatcher.cancel_task(task_id).await
    }

    pub async fn register_worker(&self, registration: WorkerRegistration) -> SchedulerResult<bool> {
        self.registry.register(registration).await
    }

    /// 注销Worker，其在途任务重新排队
    pub async fn deregister_worker(&self, worker_id: &str) -> SchedulerResult<bool> {
        if !self.registry.deregister(worker_id).await? {
            return Ok(false);
        }
        let requeued = self.dispatcher.handle_worker_lost(worker_id).await?;
        info!(worker_id, requeued, "Worker注销完成");
        Ok(true)
    }

    /// Worker上报执行结果，过期的上报返回 `false`
    pub async fn report_result(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        metrics: ExecutionMetrics,
    ) -> SchedulerResult<bool> {
        self.dispatcher.report_result(task_id, outcome, metrics).await
    }

    pub async fn summary(&self) -> SchedulerResult<TaskStatusSummary> {
        self.queue.summary().await
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        self.registry.list().await
    }

    pub async fn list_active_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.queue.list_active().await
    }
}

async fn wait_for_terminal(completion: &mut watch::Receiver<Option<TaskStatus>>) {
    loop {
        if completion.borrow_and_update().is_some() {
            return;
        }
        // 发送方被移除说明任务已结束
        if completion.changed().await.is_err() {
            return;
        }
    }
}
