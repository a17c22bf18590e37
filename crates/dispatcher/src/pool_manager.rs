use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskpool_core::{
    config::PoolConfig,
    models::{WorkerInfo, WorkerLocation, WorkerStatus},
    traits::WorkerProcessManager,
    SchedulerResult,
};
use taskpool_domain::{EventBus, ScalingEvent};
use taskpool_infrastructure::MetricsCollector;

use crate::dispatcher::Dispatcher;
use crate::task_queue::TaskQueue;
use crate::worker_registry::WorkerRegistry;

/// 扩缩容判断所需的快照
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// 可以接收任务的本地Worker（ACTIVE / SUSPECT）
    pub live: Vec<WorkerInfo>,
    /// 正在排空的本地Worker数量
    pub draining: usize,
    pub pending: usize,
    pub in_flight: usize,
}

impl PoolSnapshot {
    /// 计入上下限的本地Worker数量
    pub fn size(&self) -> usize {
        self.live.len() + self.draining
    }

    pub fn pressure(&self) -> f64 {
        self.pending as f64 / self.in_flight.max(1) as f64
    }
}

/// 扩缩容决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingAction {
    None,
    ScaleUp { reason: String },
    ScaleDown { worker_id: String },
}

/// 跨轮次保留的状态
#[derive(Debug, Default)]
pub struct PoolState {
    /// 由本管理器启动的Worker
    pub managed: HashSet<String>,
    /// 队列压力开始持续的时间
    pub pressure_since: Option<DateTime<Utc>>,
    pub last_action: Option<DateTime<Utc>>,
    pub idle_since: HashMap<String, DateTime<Utc>>,
    /// 排空开始时间
    pub draining: HashMap<String, DateTime<Utc>>,
    /// 上次运行遗留的本地Worker是否已清理
    pub orphans_retired: bool,
}

impl PoolState {
    /// 根据快照更新压力和空闲计时
    pub fn observe(&mut self, snapshot: &PoolSnapshot, config: &PoolConfig, now: DateTime<Utc>) {
        if snapshot.pressure() > config.scale_up_ratio {
            self.pressure_since.get_or_insert(now);
        } else {
            self.pressure_since = None;
        }

        // 空闲只在没有待处理任务时计时，刚启动还没分到任务的Worker不算空闲
        if snapshot.pending > 0 {
            self.idle_since.clear();
            return;
        }

        let live: HashSet<&str> = snapshot.live.iter().map(|w| w.id.as_str()).collect();
        self.idle_since.retain(|id, _| live.contains(id.as_str()));
        for worker in &snapshot.live {
            if worker.current_task_count == 0 && worker.status == WorkerStatus::Active {
                self.idle_since.entry(worker.id.clone()).or_insert(now);
            } else {
                self.idle_since.remove(&worker.id);
            }
        }
    }

    fn in_cooldown(&self, config: &PoolConfig, now: DateTime<Utc>) -> bool {
        self.last_action
            .is_some_and(|at| now - at < seconds(config.cooldown_seconds))
    }
}

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value as i64)
}

/// 在快照和历史状态上计算扩缩容决定
///
/// 低于下限的补充不受冷却时间限制，由 [`PoolManager::reconcile`] 单独处理。
pub fn scaling_decision(
    config: &PoolConfig,
    snapshot: &PoolSnapshot,
    state: &PoolState,
    now: DateTime<Utc>,
) -> ScalingAction {
    if state.in_cooldown(config, now) {
        return ScalingAction::None;
    }

    let sustained = state
        .pressure_since
        .is_some_and(|since| now - since >= seconds(config.scale_up_window_seconds));
    if sustained && snapshot.size() < config.max_workers {
        return ScalingAction::ScaleUp {
            reason: format!(
                "待处理 {} / 在途 {} 超过 {:.1}",
                snapshot.pending,
                snapshot.in_flight.max(1),
                config.scale_up_ratio
            ),
        };
    }

    if snapshot.pending == 0 && snapshot.live.len() > config.min_workers {
        let idle_window = seconds(config.idle_window_seconds);
        let longest_idle = state
            .idle_since
            .iter()
            .filter(|(_, since)| now - **since >= idle_window)
            .min_by(|(id_a, a), (id_b, b)| a.cmp(b).then_with(|| id_a.cmp(id_b)));
        if let Some((worker_id, _)) = longest_idle {
            return ScalingAction::ScaleDown {
                worker_id: worker_id.clone(),
            };
        }
    }

    ScalingAction::None
}

/// 本地Worker池管理
///
/// 保持本地Worker进程数量在 `[min_workers, max_workers]` 之间：
/// 队列压力持续时扩容，Worker长时间空闲时先排空再缩容，失效的Worker被替换。
pub struct PoolManager {
    process: Arc<dyn WorkerProcessManager>,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl PoolManager {
    pub fn new(
        process: Arc<dyn WorkerProcessManager>,
        dispatcher: Arc<Dispatcher>,
        config: PoolConfig,
        events: EventBus,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            process,
            registry: dispatcher.registry().clone(),
            queue: dispatcher.queue().clone(),
            dispatcher,
            config,
            state: Mutex::new(PoolState::default()),
            events,
            metrics,
        }
    }

    /// 当前计入上下限的本地Worker数量
    pub async fn pool_size(&self) -> SchedulerResult<usize> {
        let state = self.state.lock().await;
        Ok(self.snapshot(&state).await?.size())
    }

    async fn snapshot(&self, state: &PoolState) -> SchedulerResult<PoolSnapshot> {
        let summary = self.queue.summary().await?;
        let mut snapshot = PoolSnapshot {
            pending: summary.pending,
            in_flight: summary.in_flight(),
            ..Default::default()
        };
        for worker in self.registry.list().await? {
            if !state.managed.contains(&worker.id) {
                continue;
            }
            match worker.status {
                WorkerStatus::Active | WorkerStatus::Suspect => snapshot.live.push(worker),
                WorkerStatus::Draining => snapshot.draining += 1,
                WorkerStatus::Dead | WorkerStatus::Removed => {}
            }
        }
        Ok(snapshot)
    }

    /// 执行一轮检查
    pub async fn reconcile(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;

        if !state.orphans_retired {
            self.retire_orphans(&state).await?;
            state.orphans_retired = true;
        }
        self.replace_dead(&mut state).await?;
        self.finish_drains(&mut state, now).await?;

        let snapshot = self.snapshot(&state).await?;
        state.observe(&snapshot, &self.config, now);

        // 补足下限
        let mut size = snapshot.size();
        let mut live = snapshot.live.len();
        while live < self.config.min_workers && size < self.config.max_workers {
            if !self.scale_up(&mut state, "低于最小Worker数量", now).await? {
                break;
            }
            live += 1;
            size += 1;
        }
        if live != snapshot.live.len() {
            return Ok(());
        }

        match scaling_decision(&self.config, &snapshot, &state, now) {
            ScalingAction::None => {}
            ScalingAction::ScaleUp { reason } => {
                self.scale_up(&mut state, &reason, now).await?;
                state.pressure_since = None;
            }
            ScalingAction::ScaleDown { worker_id } => {
                if self.registry.begin_drain(&worker_id).await? {
                    info!(worker_id = %worker_id, "Worker空闲，开始缩容");
                    state.idle_since.remove(&worker_id);
                    state.draining.insert(worker_id.clone(), now);
                    state.last_action = Some(now);
                    self.metrics.record_scaling("drain", size);
                    self.events
                        .publish(ScalingEvent::DrainStarted { worker_id });
                }
            }
        }
        Ok(())
    }

    async fn scale_up(
        &self,
        state: &mut PoolState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let registration = match self.process.spawn().await {
            Ok(registration) => registration,
            Err(e) => {
                error!("启动本地Worker失败: {}", e);
                return Ok(false);
            }
        };
        let worker_id = registration.worker_id.clone();

        if !self.registry.register(registration).await? {
            warn!(worker_id = %worker_id, "新Worker的ID已被占用，终止进程");
            self.process.terminate(&worker_id).await?;
            return Ok(false);
        }

        state.managed.insert(worker_id.clone());
        state.last_action = Some(now);
        info!(
            worker_id = %worker_id,
            backend = self.process.backend_name(),
            "扩容本地Worker: {}",
            reason
        );
        self.metrics
            .record_scaling("scale_up", state.managed.len());
        self.events.publish(ScalingEvent::ScaledUp {
            worker_id,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// 注销存储中不属于本管理器的本地Worker
    ///
    /// 这些记录来自之前的进程，对应的进程已不存在，端口可能已被新Worker复用。
    async fn retire_orphans(&self, state: &PoolState) -> SchedulerResult<()> {
        for worker in self.registry.list().await? {
            if worker.location != WorkerLocation::Local
                || worker.status == WorkerStatus::Removed
                || state.managed.contains(&worker.id)
            {
                continue;
            }
            warn!(worker_id = %worker.id, "注销上次运行遗留的本地Worker");
            self.registry.deregister(&worker.id).await?;
            self.dispatcher.handle_worker_lost(&worker.id).await?;
        }
        Ok(())
    }

    /// 终止并注销失效的本地Worker，数量由下限补足
    async fn replace_dead(&self, state: &mut PoolState) -> SchedulerResult<()> {
        let managed: Vec<String> = state.managed.iter().cloned().collect();

        for worker_id in managed {
            match self.registry.get(&worker_id).await? {
                Some(worker) if worker.status == WorkerStatus::Dead => {
                    warn!(worker_id = %worker_id, "本地Worker已失效，终止并替换");
                    self.dispatcher.handle_worker_lost(&worker_id).await?;
                    self.retire(state, &worker_id).await?;
                }
                Some(worker) if worker.status != WorkerStatus::Removed => {}
                // 已被外部注销，只需回收进程
                _ => {
                    info!(worker_id = %worker_id, "本地Worker已注销，终止进程");
                    if let Err(e) = self.process.terminate(&worker_id).await {
                        error!(worker_id = %worker_id, "终止Worker进程失败: {}", e);
                    }
                    state.managed.remove(&worker_id);
                    state.draining.remove(&worker_id);
                    state.idle_since.remove(&worker_id);
                }
            }
        }
        Ok(())
    }

    async fn finish_drains(&self, state: &mut PoolState, now: DateTime<Utc>) -> SchedulerResult<()> {
        let grace = seconds(self.config.drain_grace_seconds);

        for worker in self.registry.list_by_status(WorkerStatus::Draining).await? {
            if !state.managed.contains(&worker.id) {
                continue;
            }
            let started = *state.draining.entry(worker.id.clone()).or_insert(now);

            if worker.current_task_count > 0 {
                if now - started < grace {
                    debug!(
                        worker_id = %worker.id,
                        in_flight = worker.current_task_count,
                        "等待Worker排空"
                    );
                    continue;
                }
                self.dispatcher.handle_drain_timeout(&worker.id).await?;
            }
            self.retire(state, &worker.id).await?;
        }
        Ok(())
    }

    async fn retire(&self, state: &mut PoolState, worker_id: &str) -> SchedulerResult<()> {
        if let Err(e) = self.process.terminate(worker_id).await {
            error!(worker_id, "终止Worker进程失败: {}", e);
        }
        self.registry.deregister(worker_id).await?;
        state.managed.remove(worker_id);
        state.draining.remove(worker_id);
        state.idle_since.remove(worker_id);

        info!(worker_id, "本地Worker已终止");
        self.metrics
            .record_scaling("terminate", state.managed.len());
        self.events.publish(ScalingEvent::Terminated {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    /// 关闭时终止所有由本管理器启动的Worker
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let managed: Vec<String> = state.managed.iter().cloned().collect();
        for worker_id in managed {
            self.dispatcher.handle_worker_lost(&worker_id).await?;
            self.retire(&mut state, &worker_id).await?;
        }
        Ok(())
    }

    /// Worker池检查循环，收到关闭信号后退出
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "启动Worker池管理，范围 [{}, {}]，后端: {}",
            self.config.min_workers,
            self.config.max_workers,
            self.process.backend_name()
        );

        let mut ticker = interval(Duration::from_millis(self.config.check_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        error!("Worker池检查出错: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出Worker池管理");
                    break;
                }
            }
        }
    }
}
