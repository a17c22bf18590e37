use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskpool_core::{
    config::PerformanceConfig,
    models::{ErrorType, WorkerMetric},
    traits::WorkerMetricRepository,
    SchedulerError, SchedulerResult,
};
use taskpool_domain::{EventBus, WorkerEvent};
use taskpool_infrastructure::MetricsCollector;

use crate::worker_registry::WorkerRegistry;

/// 单个Worker的指数加权移动平均
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceState {
    pub samples: u64,
    pub success_rate: f64,
    pub exec_time_ms: f64,
    pub tokens_per_second: f64,
}

impl PerformanceState {
    /// 中性先验：全部成功、执行时间和吞吐量都等于基线，对应的性能系数为1.0
    pub fn neutral(config: &PerformanceConfig) -> Self {
        Self {
            samples: 0,
            success_rate: 1.0,
            exec_time_ms: config.baseline_exec_ms,
            tokens_per_second: config.baseline_tokens_per_second,
        }
    }

    pub fn observe(&mut self, metric: &WorkerMetric, alpha: f64) {
        let blend = |prev: f64, value: f64| alpha * value + (1.0 - alpha) * prev;

        self.samples += 1;
        self.success_rate = blend(self.success_rate, if metric.success { 1.0 } else { 0.0 });

        // 执行时间和吞吐量只取成功的执行
        if !metric.success {
            return;
        }
        if metric.execution_time_ms > 0 {
            self.exec_time_ms = blend(self.exec_time_ms, metric.execution_time_ms as f64);
        }
        if metric.tokens_processed > 0 {
            if let Some(tps) = metric.tokens_per_second() {
                self.tokens_per_second = blend(self.tokens_per_second, tps);
            }
        }
    }

    pub fn factor(&self, config: &PerformanceConfig) -> f64 {
        let success = self.success_rate.clamp(0.0, 1.0);
        let speed = if self.exec_time_ms > 0.0 {
            config.baseline_exec_ms / self.exec_time_ms
        } else {
            1.0
        };
        let throughput = if config.baseline_tokens_per_second > 0.0 {
            self.tokens_per_second.max(0.0) / config.baseline_tokens_per_second
        } else {
            1.0
        };

        let factor = success.powf(config.success_weight)
            * speed.powf(config.exec_time_weight)
            * throughput.powf(config.throughput_weight);

        if factor.is_finite() {
            factor.clamp(config.min_factor, config.max_factor)
        } else {
            config.min_factor
        }
    }
}

/// 性能跟踪
///
/// 保存每次执行的指标，并据此重新计算Worker的 `performance_factor`。
pub struct PerformanceTracker {
    metric_repo: Arc<dyn WorkerMetricRepository>,
    registry: Arc<WorkerRegistry>,
    config: PerformanceConfig,
    states: RwLock<HashMap<String, PerformanceState>>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl PerformanceTracker {
    pub fn new(
        metric_repo: Arc<dyn WorkerMetricRepository>,
        registry: Arc<WorkerRegistry>,
        config: PerformanceConfig,
        events: EventBus,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            metric_repo,
            registry,
            config,
            states: RwLock::new(HashMap::new()),
            events,
            metrics,
        }
    }

    /// 记录一次执行指标并返回Worker新的性能系数
    ///
    /// 被取消的执行只保存指标，不参与评分。
    pub async fn record(&self, metric: WorkerMetric) -> SchedulerResult<f64> {
        self.metric_repo.insert(&metric).await?;

        if metric.error_type == Some(ErrorType::Cancelled) {
            debug!(worker_id = %metric.worker_id, task_id = %metric.task_id, "取消的执行不参与评分");
            return Ok(self.factor_for(&metric.worker_id).await.unwrap_or(1.0));
        }

        let factor = {
            let mut states = self.states.write().await;
            let state = states
                .entry(metric.worker_id.clone())
                .or_insert_with(|| PerformanceState::neutral(&self.config));
            state.observe(&metric, self.config.alpha);
            state.factor(&self.config)
        };

        self.publish_factor(&metric.worker_id, factor).await?;
        Ok(factor)
    }

    /// 从持久化的指标历史恢复评分
    pub async fn warm_up(&self, since: DateTime<Utc>) -> SchedulerResult<usize> {
        let history = self.metric_repo.list_since(since).await?;
        if history.is_empty() {
            return Ok(0);
        }

        let mut rebuilt: HashMap<String, PerformanceState> = HashMap::new();
        for metric in history
            .iter()
            .filter(|m| m.error_type != Some(ErrorType::Cancelled))
        {
            rebuilt
                .entry(metric.worker_id.clone())
                .or_insert_with(|| PerformanceState::neutral(&self.config))
                .observe(metric, self.config.alpha);
        }

        let factors: Vec<(String, f64)> = rebuilt
            .iter()
            .map(|(id, state)| (id.clone(), state.factor(&self.config)))
            .collect();
        *self.states.write().await = rebuilt;

        for (worker_id, factor) in &factors {
            self.publish_factor(worker_id, *factor).await?;
        }

        info!(
            "从 {} 条历史指标恢复了 {} 个Worker的性能评分",
            history.len(),
            factors.len()
        );
        Ok(factors.len())
    }

    pub async fn factor_for(&self, worker_id: &str) -> Option<f64> {
        self.states
            .read()
            .await
            .get(worker_id)
            .map(|state| state.factor(&self.config))
    }

    pub async fn state_for(&self, worker_id: &str) -> Option<PerformanceState> {
        self.states.read().await.get(worker_id).cloned()
    }

    async fn publish_factor(&self, worker_id: &str, factor: f64) -> SchedulerResult<()> {
        match self
            .registry
            .update_performance_factor(worker_id, factor)
            .await
        {
            Ok(()) => {}
            // 历史中已经不存在的Worker只保留内存评分
            Err(SchedulerError::WorkerNotFound { .. }) => {
                warn!(worker_id, "Worker不存在，跳过性能系数写回");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        debug!(worker_id, performance_factor = factor, "性能系数已更新");
        self.metrics.update_performance_factor(worker_id, factor);
        self.events.publish(WorkerEvent::PerformanceUpdated {
            worker_id: worker_id.to_string(),
            performance_factor: factor,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use taskpool_core::models::{WorkerLocation, WorkerRegistration};
    use taskpool_infrastructure::{InMemoryWorkerMetricRepository, InMemoryWorkerRepository};

    fn metric(worker_id: &str, success: bool, exec_ms: i64, tokens: i64) -> WorkerMetric {
        WorkerMetric {
            worker_id: worker_id.to_string(),
            task_id: "t1".to_string(),
            execution_time_ms: exec_ms,
            tokens_processed: tokens,
            prompt_length: 10,
            output_length: 100,
            success,
            error_type: if success { None } else { Some(ErrorType::WorkerError) },
            measured_at: Utc::now(),
        }
    }

    async fn tracker() -> (PerformanceTracker, Arc<WorkerRegistry>) {
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(InMemoryWorkerRepository::new()),
            Arc::new(Notify::new()),
            EventBus::default(),
        ));
        registry
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                location: WorkerLocation::Remote,
                endpoint_url: "http://w1:9000".to_string(),
                max_concurrent_tasks: 1,
                supported_task_types: vec![],
                performance_factor: None,
            })
            .await
            .unwrap();
        let tracker = PerformanceTracker::new(
            Arc::new(InMemoryWorkerMetricRepository::new()),
            registry.clone(),
            PerformanceConfig::default(),
            EventBus::default(),
            MetricsCollector::new(),
        );
        (tracker, registry)
    }

    #[test]
    fn test_neutral_prior_gives_unit_factor() {
        let config = PerformanceConfig::default();
        let state = PerformanceState::neutral(&config);
        assert!((state.factor(&config) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_run_keeps_factor_at_one() {
        let config = PerformanceConfig::default();
        let mut state = PerformanceState::neutral(&config);
        let tokens = (config.baseline_tokens_per_second * config.baseline_exec_ms / 1000.0) as i64;
        state.observe(
            &metric("w1", true, config.baseline_exec_ms as i64, tokens),
            config.alpha,
        );
        assert!((state.factor(&config) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_failures_only_move_success_rate() {
        let config = PerformanceConfig::default();
        let mut state = PerformanceState::neutral(&config);
        state.observe(&metric("w1", false, 1, 0), config.alpha);

        assert!((state.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(state.exec_time_ms, config.baseline_exec_ms);
        assert!(state.factor(&config) < 1.0);
    }

    #[test]
    fn test_factor_is_clamped() {
        let config = PerformanceConfig::default();
        let mut state = PerformanceState::neutral(&config);
        for _ in 0..50 {
            state.observe(&metric("w1", false, 10, 0), config.alpha);
        }
        assert_eq!(state.factor(&config), config.min_factor);

        let mut fast = PerformanceState::neutral(&config);
        for _ in 0..50 {
            fast.observe(&metric("w1", true, 1, 100_000), config.alpha);
        }
        assert_eq!(fast.factor(&config), config.max_factor);
    }

    #[tokio::test]
    async fn test_record_updates_worker_factor() {
        let (tracker, registry) = tracker().await;

        let factor = tracker.record(metric("w1", true, 5_000, 500)).await.unwrap();
        assert!(factor > 1.0);
        let worker = registry.require("w1").await.unwrap();
        assert!((worker.performance_factor - factor).abs() < 1e-9);

        let after_failure = tracker.record(metric("w1", false, 100, 0)).await.unwrap();
        assert!(after_failure < factor);
    }

    #[tokio::test]
    async fn test_cancelled_runs_do_not_affect_score() {
        let (tracker, _) = tracker().await;
        let mut cancelled = metric("w1", false, 100, 0);
        cancelled.error_type = Some(ErrorType::Cancelled);

        assert_eq!(tracker.record(cancelled).await.unwrap(), 1.0);
        assert!(tracker.state_for("w1").await.is_none());
    }

    #[tokio::test]
    async fn test_warm_up_rebuilds_from_history() {
        let (tracker, registry) = tracker().await;
        tracker.record(metric("w1", false, 100, 0)).await.unwrap();
        tracker.record(metric("w1", false, 100, 0)).await.unwrap();
        let expected = tracker.factor_for("w1").await.unwrap();

        let restarted = PerformanceTracker::new(
            tracker.metric_repo.clone(),
            registry,
            PerformanceConfig::default(),
            EventBus::default(),
            MetricsCollector::new(),
        );
        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(restarted.warm_up(since).await.unwrap(), 1);
        assert!((restarted.factor_for("w1").await.unwrap() - expected).abs() < 1e-9);
    }
}
