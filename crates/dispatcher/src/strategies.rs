use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use taskpool_core::{
    config::DispatcherConfig,
    models::{Task, WorkerInfo},
    traits::TaskDispatchStrategy,
    SchedulerResult,
};

/// 过滤出可以接收该任务的Worker
fn suitable_workers<'a>(task: &Task, available_workers: &'a [WorkerInfo]) -> Vec<&'a WorkerInfo> {
    let suitable: Vec<&WorkerInfo> = available_workers
        .iter()
        .filter(|worker| worker.can_accept_task(&task.task_type))
        .collect();

    if suitable.is_empty() {
        debug!("没有支持任务类型 {} 的可用Worker", task.task_type);
    }
    suitable
}

/// 分数相同时优先选择最久未被分配的Worker，从未分配过的最优先
fn least_recently_assigned(a: &WorkerInfo, b: &WorkerInfo) -> CmpOrdering {
    a.last_assigned_at
        .cmp(&b.last_assigned_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// 按有效评分选择Worker
///
/// `score = performance_factor / (1 + latency / base_latency) / (1 + load_penalty · in_flight)`
pub struct EffectiveScoreStrategy {
    base_latency_ms: f64,
    assumed_latency_ms: f64,
    load_penalty: f64,
}

impl EffectiveScoreStrategy {
    pub fn new(base_latency_ms: f64, assumed_latency_ms: f64, load_penalty: f64) -> Self {
        Self {
            base_latency_ms,
            assumed_latency_ms,
            load_penalty,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            config.base_latency_ms,
            config.assumed_latency_ms,
            config.load_penalty,
        )
    }

    pub fn score(&self, worker: &WorkerInfo) -> f64 {
        let latency = worker
            .network_latency_ms
            .unwrap_or(self.assumed_latency_ms)
            .max(0.0);
        let in_flight = f64::from(worker.current_task_count.max(0));
        worker.performance_factor.max(0.0)
            / (1.0 + latency / self.base_latency_ms)
            / (1.0 + self.load_penalty * in_flight)
    }
}

impl Default for EffectiveScoreStrategy {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

#[async_trait]
impl TaskDispatchStrategy for EffectiveScoreStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        available_workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let selected = suitable_workers(task, available_workers)
            .into_iter()
            .map(|worker| (self.score(worker), worker))
            .max_by(|(score_a, a), (score_b, b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(CmpOrdering::Equal)
                    // max_by 取最大值，这里反转使最久未分配者胜出
                    .then_with(|| least_recently_assigned(b, a))
            });

        Ok(selected.map(|(score, worker)| {
            debug!("评分策略选择Worker: {} (评分: {:.4})", worker.id, score);
            worker.id.clone()
        }))
    }

    fn name(&self) -> &str {
        "EffectiveScore"
    }
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDispatchStrategy for RoundRobinStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        available_workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let suitable = suitable_workers(task, available_workers);
        if suitable.is_empty() {
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % suitable.len();
        let selected_worker = suitable[index];

        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            selected_worker.id,
            index,
            suitable.len()
        );

        Ok(Some(selected_worker.id.clone()))
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

#[derive(Default)]
pub struct LoadBasedStrategy;

impl LoadBasedStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskDispatchStrategy for LoadBasedStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        available_workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let selected_worker = suitable_workers(task, available_workers)
            .into_iter()
            .min_by(|a, b| {
                a.load_percentage()
                    .partial_cmp(&b.load_percentage())
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| least_recently_assigned(a, b))
            });

        Ok(selected_worker.map(|worker| {
            debug!(
                "负载均衡策略选择Worker: {} (负载: {:.1}%)",
                worker.id,
                worker.load_percentage()
            );
            worker.id.clone()
        }))
    }

    fn name(&self) -> &str {
        "LoadBased"
    }
}

/// 根据配置创建分派策略
pub fn create_strategy(config: &DispatcherConfig) -> Arc<dyn TaskDispatchStrategy> {
    match config.strategy.as_str() {
        "round_robin" => Arc::new(RoundRobinStrategy::new()),
        "load_based" => Arc::new(LoadBasedStrategy::new()),
        _ => Arc::new(EffectiveScoreStrategy::from_config(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use taskpool_core::models::{
        TaskSubmission, WorkerLocation, WorkerRegistration, WorkerStatus,
    };

    fn task() -> Task {
        Task::new(TaskSubmission::new("chat", json!({"prompt": "hi"})), 1)
    }

    fn worker(id: &str, factor: f64, latency_ms: Option<f64>) -> WorkerInfo {
        let mut worker = WorkerInfo::new(WorkerRegistration {
            worker_id: id.to_string(),
            location: WorkerLocation::Remote,
            endpoint_url: format!("http://{id}:9000"),
            max_concurrent_tasks: 4,
            supported_task_types: vec![],
            performance_factor: Some(factor),
        });
        worker.network_latency_ms = latency_ms;
        worker
    }

    #[tokio::test]
    async fn test_fast_reliable_worker_wins() {
        let strategy = EffectiveScoreStrategy::new(100.0, 100.0, 0.25);
        let a = worker("a", 0.9, Some(5.0));
        let b = worker("b", 0.6, Some(200.0));

        assert!((strategy.score(&a) - 0.9 / 1.05).abs() < 1e-9);
        assert!((strategy.score(&b) - 0.2).abs() < 1e-9);

        let selected = strategy
            .select_worker(&task(), &[b.clone(), a.clone()])
            .await
            .unwrap();
        assert_eq!(selected.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_fast_reliable_worker_wins_at_fifty_ms_base() {
        let strategy = EffectiveScoreStrategy::new(50.0, 100.0, 0.25);
        let a = worker("a", 0.9, Some(5.0));
        let b = worker("b", 0.6, Some(200.0));

        assert!((strategy.score(&a) - 0.9 / 1.1).abs() < 1e-9);
        assert!((strategy.score(&a) - 0.818_181_818).abs() < 1e-6);
        assert!((strategy.score(&b) - 0.12).abs() < 1e-9);

        let selected = strategy
            .select_worker(&task(), &[b.clone(), a.clone()])
            .await
            .unwrap();
        assert_eq!(selected.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_load_penalty_lowers_score() {
        let strategy = EffectiveScoreStrategy::new(100.0, 100.0, 0.5);
        let mut busy = worker("busy", 1.0, Some(10.0));
        busy.current_task_count = 2;
        let idle = worker("idle", 0.8, Some(10.0));

        let selected = strategy
            .select_worker(&task(), &[busy, idle])
            .await
            .unwrap();
        assert_eq!(selected.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_unprobed_worker_uses_assumed_latency() {
        let strategy = EffectiveScoreStrategy::new(100.0, 300.0, 0.0);
        let unprobed = worker("new", 1.0, None);
        assert!((strategy.score(&unprobed) - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_tie_breaks_to_least_recently_assigned() {
        let strategy = EffectiveScoreStrategy::default();
        let now = Utc::now();
        let mut recent = worker("a", 1.0, Some(10.0));
        recent.last_assigned_at = Some(now);
        let mut older = worker("b", 1.0, Some(10.0));
        older.last_assigned_at = Some(now - Duration::seconds(30));

        let selected = strategy
            .select_worker(&task(), &[recent.clone(), older])
            .await
            .unwrap();
        assert_eq!(selected.as_deref(), Some("b"));

        let never = worker("c", 1.0, Some(10.0));
        let selected = strategy
            .select_worker(&task(), &[recent, never])
            .await
            .unwrap();
        assert_eq!(selected.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_ineligible_workers_never_selected() {
        let mut suspect = worker("suspect", 5.0, Some(1.0));
        suspect.status = WorkerStatus::Suspect;
        let mut full = worker("full", 5.0, Some(1.0));
        full.current_task_count = full.max_concurrent_tasks;
        let mut other_type = worker("other", 5.0, Some(1.0));
        other_type.supported_task_types = vec!["embedding".to_string()];

        let workers = vec![suspect, full, other_type];
        for strategy in [
            create_strategy(&DispatcherConfig::default()),
            Arc::new(RoundRobinStrategy::new()) as Arc<dyn TaskDispatchStrategy>,
            Arc::new(LoadBasedStrategy::new()),
        ] {
            assert_eq!(strategy.select_worker(&task(), &workers).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let strategy = RoundRobinStrategy::new();
        let workers = vec![worker("a", 1.0, None), worker("b", 1.0, None)];

        let first = strategy.select_worker(&task(), &workers).await.unwrap();
        let second = strategy.select_worker(&task(), &workers).await.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_create_strategy_by_name() {
        let mut config = DispatcherConfig::default();
        assert_eq!(create_strategy(&config).name(), "EffectiveScore");
        config.strategy = "load_based".to_string();
        assert_eq!(create_strategy(&config).name(), "LoadBased");
        config.strategy = "round_robin".to_string();
        assert_eq!(create_strategy(&config).name(), "RoundRobin");
    }
}
