use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use taskpool_core::{
    config::DispatcherConfig,
    models::{Task, TaskFilter, TaskStatus, TaskStatusSummary, TaskSubmission, TaskTransition},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};
use taskpool_domain::{EventBus, TaskEvent};
use taskpool_infrastructure::MetricsCollector;

/// `pending` 任务被并发分配抢走时，取消操作最多重读的次数
const CANCEL_CAS_ATTEMPTS: usize = 3;

/// 任务队列
///
/// 持久化存储之上的排队语义：优先级降序、创建时间升序，退避中的任务不参与分配。
/// 所有状态修改都通过仓储的比较并交换完成。
pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    config: DispatcherConfig,
    wakeup: Arc<Notify>,
    completions: Mutex<HashMap<String, watch::Sender<Option<TaskStatus>>>>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl TaskQueue {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        config: DispatcherConfig,
        wakeup: Arc<Notify>,
        events: EventBus,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            repo,
            config,
            wakeup,
            completions: Mutex::new(HashMap::new()),
            events,
            metrics,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 校验提交的任务
    pub fn validate(&self, submission: &TaskSubmission) -> SchedulerResult<()> {
        if submission.task_type.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "任务类型不能为空".to_string(),
            ));
        }
        if submission.payload.is_null() {
            return Err(SchedulerError::InvalidTaskParams(
                "任务负载不能为空".to_string(),
            ));
        }
        if let Some(max_retries) = submission.max_retries {
            if max_retries < 0 {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "最大重试次数不能为负数: {max_retries}"
                )));
            }
        }
        if let Some(timeout) = submission.timeout_seconds {
            if timeout <= 0 {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "任务超时时间必须大于0: {timeout}"
                )));
            }
        }
        if !self.config.accepts_task_type(&submission.task_type) {
            return Err(SchedulerError::UnsupportedTaskType(
                submission.task_type.clone(),
            ));
        }
        Ok(())
    }

    /// 校验并保存新任务，返回任务ID
    ///
    /// 校验失败的任务不会被保存。
    pub async fn enqueue(&self, submission: TaskSubmission) -> SchedulerResult<String> {
        self.validate(&submission)?;

        let task = Task::new(submission, self.config.default_max_retries);
        let created = self.repo.create(&task).await?;

        info!(
            task_id = %created.id,
            task_type = %created.task_type,
            priority = created.priority,
            "任务已入队"
        );
        self.metrics.record_task_submitted();
        self.events.publish(TaskEvent::Submitted {
            task_id: created.id.clone(),
            task_type: created.task_type.clone(),
            priority: created.priority,
        });
        self.wake();

        Ok(created.id)
    }

    /// 按分配顺序返回最多 `limit` 个可分配的任务
    pub async fn dequeue_candidates(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        self.repo.get_pending_candidates(now, limit).await
    }

    /// 以比较并交换的方式应用状态转换
    ///
    /// 任务进入终止状态时通知等待该任务的同步调用方。
    pub async fn mark(&self, task_id: &str, transition: &TaskTransition) -> SchedulerResult<bool> {
        let applied = self.repo.transition(task_id, transition).await?;
        if !applied {
            debug!(
                task_id,
                from = %transition.from,
                to = %transition.to,
                "状态转换未生效，任务状态已被修改"
            );
            return Ok(false);
        }

        if transition.to.is_terminal() {
            self.signal_completion(task_id, transition.to).await;
        }
        Ok(true)
    }

    pub async fn get(&self, task_id: &str) -> SchedulerResult<Task> {
        self.repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// 取消任务
    ///
    /// - `pending`：立即变为 `cancelled`
    /// - `assigned` / `running`：设置取消标记，由分发器通知Worker并在确认或宽限期后结束
    /// - `cancelled`：重复取消，直接返回 `true`
    /// - `succeeded` / `failed`：返回 `false`
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<bool> {
        for _ in 0..CANCEL_CAS_ATTEMPTS {
            let task = self.get(task_id).await?;
            let now = Utc::now();

            match task.status {
                TaskStatus::Pending => {
                    let transition = TaskTransition::cancel(TaskStatus::Pending, now);
                    if self.mark(task_id, &transition).await? {
                        info!(task_id, "待处理任务已取消");
                        self.events.publish(TaskEvent::Cancelled {
                            task_id: task_id.to_string(),
                        });
                        return Ok(true);
                    }
                    // 任务刚被分配，重新读取后按在途任务处理
                }
                TaskStatus::Assigned | TaskStatus::Running => {
                    if task.cancel_requested {
                        return Ok(true);
                    }
                    if self.repo.request_cancel(task_id, now).await? {
                        info!(task_id, status = %task.status, "已请求取消执行中的任务");
                        self.events.publish(TaskEvent::CancelRequested {
                            task_id: task_id.to_string(),
                        });
                        return Ok(true);
                    }
                }
                TaskStatus::Cancelled => return Ok(true),
                TaskStatus::Succeeded | TaskStatus::Failed => return Ok(false),
            }
        }

        warn!(task_id, "任务状态持续变化，取消失败");
        Ok(false)
    }

    /// 所有未结束的任务
    pub async fn list_active(&self) -> SchedulerResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for status in [TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Running] {
            tasks.extend(
                self.repo
                    .list(&TaskFilter {
                        status: Some(status),
                        ..Default::default()
                    })
                    .await?,
            );
        }
        Ok(tasks)
    }

    /// 某个Worker持有的在途任务
    pub async fn list_in_flight_for(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        let tasks = self
            .repo
            .list(&TaskFilter {
                worker_id: Some(worker_id.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.status.is_in_flight())
            .collect())
    }

    pub async fn summary(&self) -> SchedulerResult<TaskStatusSummary> {
        self.repo.count_by_status().await
    }

    /// 订阅任务的完成信号
    ///
    /// 订阅之后应再读取一次任务状态，以免错过订阅之前已经发生的完成。
    pub async fn subscribe_completion(&self, task_id: &str) -> watch::Receiver<Option<TaskStatus>> {
        let mut completions = self.completions.lock().await;
        completions
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// 等待方放弃时清理信号
    pub async fn release_completion(&self, task_id: &str) {
        let mut completions = self.completions.lock().await;
        if let Some(sender) = completions.get(task_id) {
            if sender.receiver_count() == 0 {
                completions.remove(task_id);
            }
        }
    }

    async fn signal_completion(&self, task_id: &str, status: TaskStatus) {
        if let Some(sender) = self.completions.lock().await.remove(task_id) {
            let _ = sender.send(Some(status));
        }
    }

    /// 唤醒分发循环
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}
