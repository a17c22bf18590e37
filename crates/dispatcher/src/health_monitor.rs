use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskpool_core::{
    config::HealthConfig,
    models::{WorkerHealthUpdate, WorkerInfo, WorkerStatus},
    traits::WorkerProber,
    SchedulerResult,
};
use taskpool_infrastructure::MetricsCollector;

use crate::worker_registry::WorkerRegistry;

/// Worker失效后的处理
#[async_trait]
pub trait WorkerFailureHandler: Send + Sync {
    /// 回收失效Worker的在途任务，返回重新排队的任务数
    async fn handle_worker_failure(&self, worker_id: &str) -> SchedulerResult<usize>;
}

/// 根据一次探测结果计算Worker的健康状态
///
/// `probe_latency_ms` 为 `None` 表示探测失败或超时。
pub fn evaluate(
    worker: &WorkerInfo,
    probe_latency_ms: Option<f64>,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> WorkerHealthUpdate {
    match probe_latency_ms {
        Some(latency) => WorkerHealthUpdate {
            status: match worker.status {
                WorkerStatus::Suspect => WorkerStatus::Active,
                other => other,
            },
            network_latency_ms: Some(latency),
            consecutive_failures: 0,
            checked_at: now,
        },
        None => {
            let failures = worker.consecutive_failures.saturating_add(1);
            let status = match worker.status {
                WorkerStatus::Suspect if failures >= config.dead_threshold => WorkerStatus::Dead,
                WorkerStatus::Active if failures >= config.suspect_threshold => {
                    WorkerStatus::Suspect
                }
                // 排空中的Worker只累计失败次数，由Worker池在宽限期后处理
                other => other,
            };
            WorkerHealthUpdate {
                status,
                network_latency_ms: None,
                consecutive_failures: failures,
                checked_at: now,
            }
        }
    }
}

/// 健康监控
///
/// 每个在册Worker有自己的探测循环和独立的超时，
/// 一个Worker的探测或失效处理变慢不会推迟其他Worker的探测，也不会阻塞分发循环。
pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    prober: Arc<dyn WorkerProber>,
    config: HealthConfig,
    failure_handler: Arc<dyn WorkerFailureHandler>,
    metrics: MetricsCollector,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        prober: Arc<dyn WorkerProber>,
        config: HealthConfig,
        failure_handler: Arc<dyn WorkerFailureHandler>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
            failure_handler,
            metrics,
        }
    }

    /// 探测所有需要检查的Worker
    pub async fn check_all(&self) -> SchedulerResult<()> {
        let workers: Vec<WorkerInfo> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|w| w.status.is_probed())
            .collect();

        debug!("开始健康检查，共 {} 个Worker", workers.len());

        let results = join_all(workers.iter().map(|worker| self.check_worker(worker))).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                error!(worker_id = %worker.id, "健康检查处理失败: {}", e);
            }
        }

        self.report_status_gauges().await
    }

    /// 探测单个Worker并写回结果，返回新的状态
    pub async fn check_worker(&self, worker: &WorkerInfo) -> SchedulerResult<WorkerStatus> {
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let latency = match timeout(probe_timeout, self.prober.probe(worker)).await {
            Ok(Ok(response)) if response.ok => Some(response.latency_ms),
            Ok(Ok(_)) => {
                debug!(worker_id = %worker.id, "Worker报告不健康");
                None
            }
            Ok(Err(e)) => {
                debug!(worker_id = %worker.id, "健康检查请求失败: {}", e);
                None
            }
            Err(_) => {
                debug!(
                    worker_id = %worker.id,
                    "健康检查超时 ({}ms)",
                    self.config.probe_timeout_ms
                );
                None
            }
        };
        self.metrics.record_probe(&worker.id, latency.is_some(), latency);

        let update = evaluate(worker, latency, &self.config, Utc::now());
        if !self.registry.apply_health(worker, &update).await? {
            debug!(worker_id = %worker.id, "健康检查期间Worker状态已变化，忽略本次结果");
            return Ok(worker.status);
        }

        if update.status != worker.status {
            match update.status {
                WorkerStatus::Active => {
                    info!(worker_id = %worker.id, "Worker恢复正常");
                }
                WorkerStatus::Suspect | WorkerStatus::Dead => {
                    warn!(
                        worker_id = %worker.id,
                        consecutive_failures = update.consecutive_failures,
                        "Worker健康检查失败，状态 {} -> {}",
                        worker.status,
                        update.status
                    );
                }
                _ => {}
            }
        }

        if update.status == WorkerStatus::Dead {
            let requeued = self.failure_handler.handle_worker_failure(&worker.id).await?;
            info!(worker_id = %worker.id, "失效Worker的 {} 个任务已重新排队", requeued);
        }

        Ok(update.status)
    }

    async fn report_status_gauges(&self) -> SchedulerResult<()> {
        let workers = self.registry.list().await?;
        for status in [
            WorkerStatus::Active,
            WorkerStatus::Suspect,
            WorkerStatus::Dead,
            WorkerStatus::Draining,
        ] {
            let count = workers.iter().filter(|w| w.status == status).count();
            self.metrics
                .update_workers_by_status(&status.to_string(), count);
        }
        Ok(())
    }

    fn ticker(&self) -> Interval {
        let mut ticker = interval(Duration::from_millis(self.config.probe_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// 健康检查循环，收到关闭信号后退出
    ///
    /// 每个间隔刷新一次Worker列表，为新出现的Worker启动探测循环。
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "启动健康检查循环，间隔 {}ms，超时 {}ms",
            self.config.probe_interval_ms, self.config.probe_timeout_ms
        );

        let mut probes: HashMap<String, JoinHandle<()>> = HashMap::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.spawn_missing_probes(&mut probes, &stop_rx).await {
                        error!("刷新健康检查列表出错: {}", e);
                    }
                    if let Err(e) = self.report_status_gauges().await {
                        error!("更新Worker状态指标出错: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出健康检查循环");
                    break;
                }
            }
        }

        stop_tx.send_replace(true);
        for (worker_id, handle) in probes {
            if let Err(e) = handle.await {
                error!(worker_id = %worker_id, "探测循环异常退出: {}", e);
            }
        }
    }

    async fn spawn_missing_probes(
        self: &Arc<Self>,
        probes: &mut HashMap<String, JoinHandle<()>>,
        stop: &watch::Receiver<bool>,
    ) -> SchedulerResult<()> {
        probes.retain(|_, handle| !handle.is_finished());

        for worker in self.registry.list().await? {
            if !worker.status.is_probed() || probes.contains_key(&worker.id) {
                continue;
            }
            debug!(worker_id = %worker.id, "启动Worker探测循环");
            let handle = tokio::spawn(
                Arc::clone(self).probe_loop(worker.id.clone(), stop.clone()),
            );
            probes.insert(worker.id, handle);
        }
        Ok(())
    }

    /// 单个Worker的探测循环，Worker不再需要探测时退出
    async fn probe_loop(self: Arc<Self>, worker_id: String, mut stop: watch::Receiver<bool>) {
        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                // 创建后有过任何发送都会立即返回，不会错过停止信号
                _ = stop.changed() => break,
            }

            let worker = match self.registry.get(&worker_id).await {
                Ok(Some(worker)) if worker.status.is_probed() => worker,
                Ok(_) => {
                    debug!(worker_id = %worker_id, "Worker不再需要探测，结束探测循环");
                    break;
                }
                Err(e) => {
                    error!(worker_id = %worker_id, "读取Worker失败: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.check_worker(&worker).await {
                error!(worker_id = %worker_id, "健康检查处理失败: {}", e);
            }
        }
    }
}
