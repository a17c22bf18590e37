use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use taskpool_core::{models::WorkerMetric, traits::WorkerMetricRepository, SchedulerResult};

/// 内存指标仓储，只追加
#[derive(Default)]
pub struct InMemoryWorkerMetricRepository {
    metrics: RwLock<Vec<WorkerMetric>>,
}

impl InMemoryWorkerMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerMetricRepository for InMemoryWorkerMetricRepository {
    async fn insert(&self, metric: &WorkerMetric) -> SchedulerResult<()> {
        self.metrics.write().await.push(metric.clone());
        Ok(())
    }

    async fn list_by_worker(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<WorkerMetric>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .iter()
            .rev()
            .filter(|m| m.worker_id == worker_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> SchedulerResult<Vec<WorkerMetric>> {
        let metrics = self.metrics.read().await;
        let mut list: Vec<WorkerMetric> = metrics
            .iter()
            .filter(|m| m.measured_at >= since)
            .cloned()
            .collect();
        list.sort_by_key(|m| m.measured_at);
        Ok(list)
    }
}
