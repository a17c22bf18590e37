use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskpool_core::{
    config::DispatcherConfig,
    models::{
        ErrorType, ExecutionMetrics, Task, TaskExecutionMessage, TaskOutcome, TaskStatus,
        TaskTransition, WorkerInfo, WorkerMetric, WorkerStatus,
    },
    traits::{TaskDispatchStrategy, WorkerTransport},
    SchedulerResult,
};
use taskpool_domain::{EventBus, PoolEventKind, TaskEvent};
use taskpool_infrastructure::MetricsCollector;

use crate::health_monitor::WorkerFailureHandler;
use crate::performance_tracker::PerformanceTracker;
use crate::retry_service::{RetryDecision, RetryPolicy};
use crate::task_queue::TaskQueue;
use crate::worker_registry::WorkerRegistry;

/// 已经标记为运行、等待投递给Worker的任务
struct PendingForward {
    worker: WorkerInfo,
    message: TaskExecutionMessage,
}

/// 一轮分配的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub assigned: usize,
    pub stalled: usize,
}

/// 任务分发器
///
/// 任务状态和Worker在途任务数的唯一写入方。分配、结果处理、超时和Worker失效
/// 都经过这里，任务状态的每次修改都是比较并交换，多实例共享存储时同样安全。
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    tracker: Arc<PerformanceTracker>,
    transport: Arc<dyn WorkerTransport>,
    strategy: Arc<dyn TaskDispatchStrategy>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    wakeup: Arc<Notify>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        tracker: Arc<PerformanceTracker>,
        transport: Arc<dyn WorkerTransport>,
        strategy: Arc<dyn TaskDispatchStrategy>,
        retry: RetryPolicy,
        config: DispatcherConfig,
        wakeup: Arc<Notify>,
        events: EventBus,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            queue,
            registry,
            tracker,
            transport,
            strategy,
            retry,
            config,
            wakeup,
            events,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// 分发循环
    ///
    /// 入队、Worker可用、结果上报都会唤醒循环；定时清扫处理超时和取消宽限期。
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "启动任务分发循环，策略: {}，清扫间隔: {}ms",
            self.strategy.name(),
            self.config.sweep_interval_ms
        );

        let mut sweeper = interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {
                    self.run_cycle(false).await;
                }
                _ = sweeper.tick() => {
                    self.run_cycle(true).await;
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出任务分发循环");
                    break;
                }
            }
        }
    }

    async fn run_cycle(&self, with_sweep: bool) {
        let now = Utc::now();
        if with_sweep {
            if let Err(e) = self.sweep(now).await {
                error!("清扫超时任务时出错: {}", e);
            }
        }
        if let Err(e) = self.schedule_pending(now).await {
            error!("分配任务时出错: {}", e);
        }
    }

    /// 为待处理任务分配Worker
    pub async fn schedule_pending(&self, now: DateTime<Utc>) -> SchedulerResult<ScheduleReport> {
        let started = Instant::now();
        let candidates = self
            .queue
            .dequeue_candidates(self.config.batch_size, now)
            .await?;

        let mut report = ScheduleReport::default();
        let mut forwards = Vec::new();

        if !candidates.is_empty() {
            let mut workers = self.registry.list_eligible().await?;

            for task in &candidates {
                let Some(worker_id) = self.strategy.select_worker(task, &workers).await? else {
                    report.stalled += 1;
                    continue;
                };

                match self.try_assign(task, &worker_id, now).await {
                    Ok(Some(forward)) => {
                        report.assigned += 1;
                        // 本轮后续的选择要看到这次分配
                        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
                            worker.current_task_count += 1;
                            worker.last_assigned_at = Some(now);
                        }
                        forwards.push(forward);
                    }
                    Ok(None) => {
                        report.stalled += 1;
                        workers = self.registry.list_eligible().await?;
                    }
                    Err(e) => {
                        report.stalled += 1;
                        error!(task_id = %task.id, worker_id = %worker_id, "分配任务失败: {}", e);
                    }
                }
            }

            if report.assigned > 0 {
                debug!("本轮分配了 {} 个任务", report.assigned);
            }
        }

        // 投递在锁外并发进行，每个都有超时
        join_all(forwards.into_iter().map(|f| self.forward(f))).await;

        self.publish_queue_depth(report.stalled).await?;
        self.metrics
            .record_scheduling_duration(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// 在Worker互斥区内完成 检查容量 → 占用槽位 → 分配 → 标记运行
    async fn try_assign(
        &self,
        task: &Task,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<PendingForward>> {
        let _guard = self.registry.lock_worker(worker_id).await;

        let worker = match self.registry.get(worker_id).await? {
            Some(worker) if worker.can_accept_task(&task.task_type) => worker,
            _ => {
                debug!(worker_id, task_id = %task.id, "Worker已不可用或已满，跳过");
                return Ok(None);
            }
        };

        // 先占用槽位再分配，处于 ASSIGNED 的任务总是持有一个槽位
        self.registry.adjust_task_count(worker_id, 1).await?;
        let assigned = match self
            .queue
            .mark(&task.id, &TaskTransition::assign(worker_id, now))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.release_reserved_slot(worker_id).await;
                return Err(e);
            }
        };
        if !assigned {
            debug!(task_id = %task.id, "任务已被其他分发器处理或已取消");
            self.release_reserved_slot(worker_id).await;
            return Ok(None);
        }
        let attempt = task.attempt_count + 1;

        // 分配已生效，之后的错误不再向上传播，任务留在 ASSIGNED 由清扫回收
        if let Err(e) = self.registry.record_assignment(worker_id, now).await {
            warn!(worker_id, "记录分配时间失败: {}", e);
        }
        self.metrics.record_task_assigned();
        self.events.publish(TaskEvent::Assigned {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            attempt,
        });

        let timeout_seconds = self
            .config
            .timeout_for(&task.task_type, task.timeout_seconds);
        let deadline = now + chrono::Duration::seconds(timeout_seconds);
        match self
            .queue
            .mark(&task.id, &TaskTransition::start(attempt, deadline, now))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // 其他实例已经回收了这次分配，槽位由它释放
                warn!(task_id = %task.id, "任务分配后被其他清扫回收，放弃投递");
                return Ok(None);
            }
            Err(e) => {
                error!(task_id = %task.id, worker_id, "标记任务运行失败，等待清扫回收: {}", e);
                return Ok(None);
            }
        }

        info!(
            task_id = %task.id,
            worker_id,
            attempt,
            "任务已分配"
        );
        self.events.publish(TaskEvent::Started {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            attempt,
            deadline,
        });

        Ok(Some(PendingForward {
            message: TaskExecutionMessage {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                attempt,
                timeout_seconds,
                deadline: Some(deadline),
            },
            worker,
        }))
    }

    async fn forward(&self, forward: PendingForward) {
        let PendingForward { worker, message } = forward;
        let forward_timeout = Duration::from_millis(self.config.forward_timeout_ms);

        let error = match timeout(forward_timeout, self.transport.dispatch(&worker, &message)).await
        {
            Ok(Ok(())) => {
                debug!(task_id = %message.task_id, worker_id = %worker.id, "任务已投递");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("投递超时 ({}ms)", self.config.forward_timeout_ms),
        };

        warn!(
            task_id = %message.task_id,
            worker_id = %worker.id,
            "任务投递失败: {}",
            error
        );
        let metrics = ExecutionMetrics::new(worker.id.clone(), 0).for_attempt(message.attempt);
        let outcome = TaskOutcome::Failed {
            error_type: ErrorType::Network,
            message: error,
            retryable: true,
        };
        if let Err(e) = self.report_result(&message.task_id, outcome, metrics).await {
            error!(task_id = %message.task_id, "处理投递失败时出错: {}", e);
        }
    }

    /// 处理Worker上报的执行结果
    ///
    /// 与任务当前的Worker或执行次数不符的上报视为过期，返回 `false`。
    pub async fn report_result(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        metrics: ExecutionMetrics,
    ) -> SchedulerResult<bool> {
        let task = self.queue.get(task_id).await?;
        let worker_id = metrics.worker_id.as_str();

        let stale = task.status != TaskStatus::Running
            || task.assigned_worker_id.as_deref() != Some(worker_id)
            || metrics
                .attempt
                .is_some_and(|attempt| attempt != task.attempt_count);
        if stale {
            warn!(
                task_id,
                worker_id,
                status = %task.status,
                "忽略过期的执行结果"
            );
            return Ok(false);
        }

        let now = Utc::now();
        let metric = WorkerMetric {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            execution_time_ms: metrics.execution_time_ms.max(0),
            tokens_processed: metrics.tokens_processed.max(0),
            prompt_length: metrics.prompt_length.max(0),
            output_length: metrics.output_length.max(0),
            success: outcome.is_success(),
            error_type: outcome.error_type(),
            measured_at: now,
        };

        let applied = match outcome {
            TaskOutcome::Succeeded { result } => {
                let transition = TaskTransition::succeed(task.attempt_count, result, now);
                let applied = self.queue.mark(task_id, &transition).await?;
                if applied {
                    self.release_slot(worker_id).await?;
                    info!(task_id, worker_id, attempt = task.attempt_count, "任务执行成功");
                    self.metrics.record_task_finished(
                        "succeeded",
                        metrics.execution_time_ms.max(0) as f64 / 1000.0,
                    );
                    self.events.publish(TaskEvent::Succeeded {
                        task_id: task_id.to_string(),
                        worker_id: worker_id.to_string(),
                        attempt: task.attempt_count,
                    });
                }
                applied
            }
            TaskOutcome::Failed {
                error_type,
                message,
                retryable,
            } => {
                self.settle_failure(&task, error_type, &message, retryable, now)
                    .await?
            }
            TaskOutcome::Cancelled => self.settle_cancelled(&task, now).await?,
        };

        if applied {
            self.tracker.record(metric).await?;
        }
        Ok(applied)
    }

    /// 失败后按重试策略重新排队或结束任务
    async fn settle_failure(
        &self,
        task: &Task,
        error_type: ErrorType,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let attempt = task.attempt_count;
        let worker_id = task.assigned_worker_id.clone();

        let applied = match self.retry.decide(task, error_type, retryable, now) {
            RetryDecision::Requeue { not_before } => {
                let transition =
                    TaskTransition::requeue(attempt, Some(not_before), error_type, message, now);
                let applied = self.queue.mark(&task.id, &transition).await?;
                if applied {
                    info!(
                        task_id = %task.id,
                        attempt,
                        error_type = %error_type,
                        "任务失败，{} 后重试",
                        not_before
                    );
                    self.metrics.record_task_retry(error_type.as_str());
                    self.events.publish(TaskEvent::Requeued {
                        task_id: task.id.clone(),
                        attempt,
                        error_type,
                        not_before: Some(not_before),
                    });
                }
                applied
            }
            RetryDecision::Fail => {
                let transition = TaskTransition::fail(attempt, error_type, message, now);
                let applied = self.queue.mark(&task.id, &transition).await?;
                if applied {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        error_type = %error_type,
                        "任务执行失败: {}",
                        message
                    );
                    self.metrics.record_task_failure(error_type.as_str());
                    self.metrics
                        .record_task_finished("failed", elapsed_seconds(task, now));
                    self.events.publish(TaskEvent::Failed {
                        task_id: task.id.clone(),
                        attempt,
                        error_type,
                    });
                }
                applied
            }
        };

        if applied {
            if let Some(worker_id) = worker_id {
                self.release_slot(&worker_id).await?;
            }
        }
        Ok(applied)
    }

    async fn settle_cancelled(&self, task: &Task, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let transition =
            TaskTransition::cancel(TaskStatus::Running, now).with_expected_attempt(task.attempt_count);
        let applied = self.queue.mark(&task.id, &transition).await?;
        if applied {
            info!(task_id = %task.id, "任务已取消");
            self.metrics
                .record_task_finished("cancelled", elapsed_seconds(task, now));
            self.events.publish(TaskEvent::Cancelled {
                task_id: task.id.clone(),
            });
            if let Some(worker_id) = &task.assigned_worker_id {
                self.release_slot(worker_id).await?;
            }
        }
        Ok(applied)
    }

    async fn release_slot(&self, worker_id: &str) -> SchedulerResult<()> {
        self.registry.adjust_task_count(worker_id, -1).await
    }

    async fn release_reserved_slot(&self, worker_id: &str) {
        if let Err(e) = self.release_slot(worker_id).await {
            error!(worker_id, "释放预留槽位失败: {}", e);
        }
    }

    /// 回收停在 ASSIGNED 的任务：补上运行标记，之后按运行中的任务处理
    ///
    /// 分配和标记运行之间崩溃或出错会留下这种任务。返回 `None` 表示任务已被其他流程处理。
    async fn recover_assigned(
        &self,
        task: &Task,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>> {
        let transition = TaskTransition::start(task.attempt_count, deadline, now);
        if !self.queue.mark(&task.id, &transition).await? {
            return Ok(None);
        }
        warn!(
            task_id = %task.id,
            worker_id = ?task.assigned_worker_id,
            attempt = task.attempt_count,
            "回收未标记运行的已分配任务"
        );
        self.queue.get(&task.id).await.map(Some)
    }

    /// 在途任务的运行视图，必要时先回收 ASSIGNED 状态
    async fn running_view(
        &self,
        task: Task,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>> {
        match task.status {
            TaskStatus::Running => Ok(Some(task)),
            TaskStatus::Assigned => self.recover_assigned(&task, deadline, now).await,
            _ => Ok(None),
        }
    }

    async fn worker_lost(&self, worker_id: &str) -> SchedulerResult<bool> {
        Ok(match self.registry.get(worker_id).await? {
            Some(worker) => matches!(worker.status, WorkerStatus::Dead | WorkerStatus::Removed),
            None => true,
        })
    }

    /// 清扫运行中的任务：超时、取消宽限期到期、Worker已失效
    pub async fn sweep(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let grace = chrono::Duration::seconds(self.config.cancel_grace_seconds as i64);
        let mut settled = 0;
        let mut lost_workers: Vec<String> = Vec::new();

        let assign_window = chrono::Duration::milliseconds(self.config.forward_timeout_ms as i64);

        for task in self.queue.list_active().await? {
            let task = match task.status {
                TaskStatus::Running => task,
                TaskStatus::Assigned => {
                    let Some(worker_id) = task.assigned_worker_id.clone() else {
                        continue;
                    };
                    if self.worker_lost(&worker_id).await? {
                        if !lost_workers.contains(&worker_id) {
                            lost_workers.push(worker_id);
                        }
                        continue;
                    }
                    if task.updated_at + assign_window > now {
                        // 可能正在分配中
                        continue;
                    }
                    // 分配后一直没有标记运行，按本次执行超时处理
                    let recovered = {
                        let _guard = self.registry.lock_worker(&worker_id).await;
                        self.recover_assigned(&task, now, now).await?
                    };
                    match recovered {
                        Some(task) => task,
                        None => continue,
                    }
                }
                _ => continue,
            };

            if task.cancel_requested {
                let expired = task.cancel_requested_at.is_some_and(|at| at + grace <= now);
                if expired && self.settle_cancelled(&task, now).await? {
                    warn!(task_id = %task.id, "Worker未确认取消，宽限期后强制结束");
                    self.record_attempt_metric(&task, ErrorType::Cancelled, now)
                        .await?;
                    settled += 1;
                }
                continue;
            }

            if task.deadline.is_some_and(|deadline| deadline <= now) {
                warn!(task_id = %task.id, attempt = task.attempt_count, "任务执行超时");
                if self
                    .settle_failure(&task, ErrorType::Timeout, "任务执行超时", true, now)
                    .await?
                {
                    self.record_attempt_metric(&task, ErrorType::Timeout, now)
                        .await?;
                    settled += 1;
                }
                continue;
            }

            // 重启后可能遗留在失效Worker上的任务
            if let Some(worker_id) = &task.assigned_worker_id {
                if lost_workers.contains(worker_id) {
                    continue;
                }
                if self.worker_lost(worker_id).await? {
                    lost_workers.push(worker_id.clone());
                }
            }
        }

        for worker_id in lost_workers {
            settled += self.handle_worker_lost(&worker_id).await?;
        }
        Ok(settled)
    }

    /// 记录由调度器判定的执行结果（超时、Worker失效等）
    async fn record_attempt_metric(
        &self,
        task: &Task,
        error_type: ErrorType,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let Some(worker_id) = &task.assigned_worker_id else {
            return Ok(());
        };
        let execution_time_ms = task
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0))
            .unwrap_or(0);
        let metric = WorkerMetric {
            worker_id: worker_id.clone(),
            task_id: task.id.clone(),
            execution_time_ms,
            tokens_processed: 0,
            prompt_length: 0,
            output_length: 0,
            success: false,
            error_type: Some(error_type),
            measured_at: now,
        };
        self.tracker.record(metric).await.map(|_| ())
    }

    /// Worker失效：在途任务直接回到待处理状态，不退避也不计为失败
    pub async fn handle_worker_lost(&self, worker_id: &str) -> SchedulerResult<usize> {
        let _guard = self.registry.lock_worker(worker_id).await;
        let now = Utc::now();
        let mut requeued = 0;

        for task in self.queue.list_in_flight_for(worker_id).await? {
            let deadline = self.deadline_for(&task, now);
            let Some(task) = self.running_view(task, deadline, now).await? else {
                continue;
            };

            if task.cancel_requested {
                if self.settle_cancelled(&task, now).await? {
                    self.record_attempt_metric(&task, ErrorType::Cancelled, now)
                        .await?;
                }
                continue;
            }

            let transition = TaskTransition::requeue(
                task.attempt_count,
                None,
                ErrorType::WorkerLost,
                format!("Worker {worker_id} 失效"),
                now,
            );
            if self.queue.mark(&task.id, &transition).await? {
                self.release_slot(worker_id).await?;
                self.record_attempt_metric(&task, ErrorType::WorkerLost, now)
                    .await?;
                self.events.publish(TaskEvent::Requeued {
                    task_id: task.id.clone(),
                    attempt: task.attempt_count,
                    error_type: ErrorType::WorkerLost,
                    not_before: None,
                });
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(worker_id, "已将 {} 个任务重新排队", requeued);
            self.queue.wake();
        }
        Ok(requeued)
    }

    /// 排空超时：剩余任务按普通失败走重试流程
    pub async fn handle_drain_timeout(&self, worker_id: &str) -> SchedulerResult<usize> {
        let _guard = self.registry.lock_worker(worker_id).await;
        let now = Utc::now();
        let mut settled = 0;

        for task in self.queue.list_in_flight_for(worker_id).await? {
            let Some(task) = self.running_view(task, now, now).await? else {
                continue;
            };
            if self
                .settle_failure(&task, ErrorType::DrainTimeout, "Worker排空超时", true, now)
                .await?
            {
                self.record_attempt_metric(&task, ErrorType::DrainTimeout, now)
                    .await?;
                settled += 1;
            }
        }

        if settled > 0 {
            warn!(worker_id, "排空超时，{} 个任务按失败处理", settled);
            self.queue.wake();
        }
        Ok(settled)
    }

    /// 取消任务并尽力通知Worker
    pub async fn cancel_task(&self, task_id: &str) -> SchedulerResult<bool> {
        let before = self.queue.get(task_id).await?;
        if before.cancel_requested && before.status.is_in_flight() {
            // 已经通知过Worker
            return Ok(true);
        }
        if !self.queue.cancel(task_id).await? {
            return Ok(false);
        }

        let task = self.queue.get(task_id).await?;
        if !task.status.is_in_flight() {
            return Ok(true);
        }
        let Some(worker_id) = task.assigned_worker_id.as_deref() else {
            return Ok(true);
        };
        let Some(worker) = self.registry.get(worker_id).await? else {
            return Ok(true);
        };

        let cancel_timeout = Duration::from_millis(self.config.forward_timeout_ms);
        match timeout(cancel_timeout, self.transport.cancel(&worker, task_id)).await {
            Ok(Ok(())) => debug!(task_id, worker_id, "已通知Worker取消任务"),
            Ok(Err(e)) => warn!(task_id, worker_id, "通知Worker取消失败: {}", e),
            Err(_) => warn!(task_id, worker_id, "通知Worker取消超时"),
        }
        Ok(true)
    }

    fn deadline_for(&self, task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(
            self.config
                .timeout_for(&task.task_type, task.timeout_seconds),
        )
    }

    /// 同步调用方的最长等待时间
    pub fn wait_budget(&self, task: &Task) -> Duration {
        let attempt_timeout = self
            .config
            .timeout_for(&task.task_type, task.timeout_seconds)
            .max(0) as u64;
        self.retry
            .total_budget(task.max_retries, Duration::from_secs(attempt_timeout))
            + Duration::from_secs(self.config.cancel_grace_seconds)
    }

    async fn publish_queue_depth(&self, stalled: usize) -> SchedulerResult<()> {
        let summary = self.queue.summary().await?;
        self.metrics
            .update_queue_depth(summary.pending, summary.in_flight(), stalled);
        self.events.publish(PoolEventKind::QueueDepth {
            pending: summary.pending,
            in_flight: summary.in_flight(),
            stalled,
        });
        Ok(())
    }
}

fn elapsed_seconds(task: &Task, now: DateTime<Utc>) -> f64 {
    task.started_at
        .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}

#[async_trait]
impl WorkerFailureHandler for Dispatcher {
    async fn handle_worker_failure(&self, worker_id: &str) -> SchedulerResult<usize> {
        self.handle_worker_lost(worker_id).await
    }
}
