use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use taskpool_core::{
    models::{WorkerHealthUpdate, WorkerInfo, WorkerStatus},
    traits::WorkerRepository,
    SchedulerError, SchedulerResult,
};

/// 内存Worker仓储
#[derive(Default)]
pub struct InMemoryWorkerRepository {
    workers: RwLock<HashMap<String, WorkerInfo>>,
}

impl InMemoryWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(worker_id: &str) -> SchedulerError {
        SchedulerError::WorkerNotFound {
            id: worker_id.to_string(),
        }
    }
}

#[async_trait]
impl WorkerRepository for InMemoryWorkerRepository {
    async fn register(&self, worker: &WorkerInfo) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&worker.id) {
            if !existing.status.allows_reregistration() {
                return Ok(false);
            }
        }
        workers.insert(worker.id.clone(), worker.clone());
        debug!("注册Worker成功: {}", worker.id);
        Ok(true)
    }

    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<WorkerInfo>> {
        Ok(self.workers.read().await.get(worker_id).cloned())
    }

    async fn list(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        let workers = self.workers.read().await;
        let mut list: Vec<WorkerInfo> = workers
            .values()
            .filter(|w| w.status != WorkerStatus::Removed)
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(list)
    }

    async fn get_by_status(&self, status: WorkerStatus) -> SchedulerResult<Vec<WorkerInfo>> {
        let workers = self.workers.read().await;
        let mut list: Vec<WorkerInfo> = workers
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn update_status(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
    ) -> SchedulerResult<bool> {
        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidWorkerTransition {
                id: worker_id.to_string(),
                from,
                to,
            });
        }

        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Self::not_found(worker_id))?;
        if worker.status != from {
            return Ok(false);
        }
        worker.status = to;
        Ok(true)
    }

    async fn update_health(
        &self,
        worker_id: &str,
        expected: WorkerStatus,
        update: &WorkerHealthUpdate,
    ) -> SchedulerResult<bool> {
        if expected != update.status && !expected.can_transition_to(update.status) {
            return Err(SchedulerError::InvalidWorkerTransition {
                id: worker_id.to_string(),
                from: expected,
                to: update.status,
            });
        }

        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Self::not_found(worker_id))?;
        if worker.status != expected {
            return Ok(false);
        }

        worker.status = update.status;
        if let Some(latency) = update.network_latency_ms {
            worker.network_latency_ms = Some(latency);
        }
        worker.consecutive_failures = update.consecutive_failures;
        worker.last_health_check = Some(update.checked_at);
        Ok(true)
    }

    async fn update_performance_factor(
        &self,
        worker_id: &str,
        factor: f64,
    ) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Self::not_found(worker_id))?;
        worker.performance_factor = factor;
        Ok(())
    }

    async fn adjust_task_count(&self, worker_id: &str, delta: i32) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Self::not_found(worker_id))?;
        worker.current_task_count = (worker.current_task_count + delta).max(0);
        Ok(())
    }

    async fn record_assignment(&self, worker_id: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Self::not_found(worker_id))?;
        worker.last_assigned_at = Some(at);
        Ok(())
    }
}
