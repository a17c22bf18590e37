use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, info, warn};

use taskpool_core::{
    models::{WorkerHealthUpdate, WorkerInfo, WorkerRegistration, WorkerStatus},
    traits::WorkerRepository,
    SchedulerError, SchedulerResult,
};
use taskpool_domain::{EventBus, WorkerEvent};

/// Worker注册表
///
/// 对仓储的按字段写操作做一层封装，并提供每个Worker独立的互斥区，
/// 分配任务和回收失效Worker的任务都要先进入该互斥区。
pub struct WorkerRegistry {
    repo: Arc<dyn WorkerRepository>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wakeup: Arc<Notify>,
    events: EventBus,
}

impl WorkerRegistry {
    pub fn new(repo: Arc<dyn WorkerRepository>, wakeup: Arc<Notify>, events: EventBus) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
            wakeup,
            events,
        }
    }

    /// 注册Worker
    ///
    /// 同ID的Worker仍在册时返回 `false`；DEAD 或已注销的Worker可以重新注册。
    pub async fn register(&self, registration: WorkerRegistration) -> SchedulerResult<bool> {
        registration.validate()?;
        let worker = WorkerInfo::new(registration);

        if !self.repo.register(&worker).await? {
            warn!(worker_id = %worker.id, "Worker已注册，拒绝重复注册");
            return Ok(false);
        }

        info!(
            worker_id = %worker.id,
            location = worker.location.as_str(),
            endpoint = %worker.endpoint_url,
            "Worker注册成功"
        );
        self.events.publish(WorkerEvent::Registered {
            worker_id: worker.id.clone(),
            location: worker.location,
        });
        self.wakeup.notify_one();
        Ok(true)
    }

    /// 注销Worker，状态变为 REMOVED
    ///
    /// 已注销时返回 `false`。在途任务由调用方重新排队。
    pub async fn deregister(&self, worker_id: &str) -> SchedulerResult<bool> {
        loop {
            let worker = self.require(worker_id).await?;
            if worker.status == WorkerStatus::Removed {
                return Ok(false);
            }
            if self
                .repo
                .update_status(worker_id, worker.status, WorkerStatus::Removed)
                .await?
            {
                info!(worker_id, from = %worker.status, "Worker已注销");
                self.publish_status_change(&worker, WorkerStatus::Removed);
                self.events.publish(WorkerEvent::Deregistered {
                    worker_id: worker_id.to_string(),
                });
                self.forget_lock(worker_id).await;
                return Ok(true);
            }
            // 状态刚被健康检查修改，重新读取
            debug!(worker_id, "注销时Worker状态已变化，重试");
        }
    }

    /// 可以接收新任务的Worker（状态为 ACTIVE）
    pub async fn list_eligible(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        self.list_by_status(WorkerStatus::Active).await
    }

    pub async fn get(&self, worker_id: &str) -> SchedulerResult<Option<WorkerInfo>> {
        self.repo.get_by_id(worker_id).await
    }

    pub async fn require(&self, worker_id: &str) -> SchedulerResult<WorkerInfo> {
        self.get(worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })
    }

    /// 所有未注销的Worker
    pub async fn list(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        self.repo.list().await
    }

    pub async fn list_by_status(&self, status: WorkerStatus) -> SchedulerResult<Vec<WorkerInfo>> {
        self.repo.get_by_status(status).await
    }

    /// ACTIVE → DRAINING，不再接收新任务
    pub async fn begin_drain(&self, worker_id: &str) -> SchedulerResult<bool> {
        let worker = self.require(worker_id).await?;
        if !self
            .repo
            .update_status(worker_id, WorkerStatus::Active, WorkerStatus::Draining)
            .await?
        {
            debug!(worker_id, status = %worker.status, "Worker不是ACTIVE状态，无法开始排空");
            return Ok(false);
        }
        info!(worker_id, "Worker开始排空");
        self.publish_status_change(&worker, WorkerStatus::Draining);
        Ok(true)
    }

    /// 写回健康检查结果，Worker状态已被其他组件修改时返回 `false`
    pub async fn apply_health(
        &self,
        worker: &WorkerInfo,
        update: &WorkerHealthUpdate,
    ) -> SchedulerResult<bool> {
        if update.status != worker.status && !worker.status.can_transition_to(update.status) {
            return Err(SchedulerError::InvalidWorkerTransition {
                id: worker.id.clone(),
                from: worker.status,
                to: update.status,
            });
        }
        if !self
            .repo
            .update_health(&worker.id, worker.status, update)
            .await?
        {
            return Ok(false);
        }

        if update.status != worker.status {
            self.events.publish(WorkerEvent::StatusChanged {
                worker_id: worker.id.clone(),
                from: worker.status,
                to: update.status,
                consecutive_failures: update.consecutive_failures,
            });
            if update.status == WorkerStatus::Active {
                self.wakeup.notify_one();
            }
        }
        Ok(true)
    }

    /// 调整在途任务数，释放槽位时唤醒分发循环
    pub async fn adjust_task_count(&self, worker_id: &str, delta: i32) -> SchedulerResult<()> {
        self.repo.adjust_task_count(worker_id, delta).await?;
        if delta < 0 {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    pub async fn record_assignment(&self, worker_id: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        self.repo.record_assignment(worker_id, at).await
    }

    pub async fn update_performance_factor(
        &self,
        worker_id: &str,
        factor: f64,
    ) -> SchedulerResult<()> {
        self.repo.update_performance_factor(worker_id, factor).await
    }

    /// 进入Worker的互斥区
    pub async fn lock_worker(&self, worker_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(worker_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn forget_lock(&self, worker_id: &str) {
        let mut locks = self.locks.lock().await;
        // 仍有人持有或等待时保留
        if locks
            .get(worker_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(worker_id);
        }
    }

    fn publish_status_change(&self, worker: &WorkerInfo, to: WorkerStatus) {
        self.events.publish(WorkerEvent::StatusChanged {
            worker_id: worker.id.clone(),
            from: worker.status,
            to,
            consecutive_failures: worker.consecutive_failures,
        });
    }
}
