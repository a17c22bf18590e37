use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use taskpool_core::{
    models::{Task, TaskFilter, TaskStatus, TaskStatusSummary, TaskTransition},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};

/// 待处理任务的排序键：优先级降序、创建时间升序、插入顺序
type PendingKey = (Reverse<i32>, DateTime<Utc>, u64);

struct TaskEntry {
    task: Task,
    seq: u64,
}

impl TaskEntry {
    fn pending_key(&self) -> PendingKey {
        (Reverse(self.task.priority), self.task.created_at, self.seq)
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, TaskEntry>,
    pending: BTreeMap<PendingKey, String>,
    next_seq: u64,
}

/// 内存任务仓储
#[derive(Default)]
pub struct InMemoryTaskRepository {
    table: RwLock<TaskTable>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut table = self.table.write().await;
        if table.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DatabaseOperation(format!(
                "任务ID重复: {}",
                task.id
            )));
        }

        table.next_seq += 1;
        let entry = TaskEntry {
            task: task.clone(),
            seq: table.next_seq,
        };
        if task.status == TaskStatus::Pending {
            table.pending.insert(entry.pending_key(), task.id.clone());
        }
        table.tasks.insert(task.id.clone(), entry);

        debug!("创建任务: {} ({})", task.id, task.task_type);
        Ok(task.clone())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let table = self.table.read().await;
        Ok(table.tasks.get(id).map(|entry| entry.task.clone()))
    }

    async fn transition(&self, id: &str, transition: &TaskTransition) -> SchedulerResult<bool> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(SchedulerError::InvalidTaskTransition {
                id: id.to_string(),
                from: transition.from,
                to: transition.to,
            });
        }

        let mut guard = self.table.write().await;
        let table = &mut *guard;
        let entry = table
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;

        if !entry.task.matches(transition) {
            debug!(
                "任务 {} 状态已变化，放弃转换 {} -> {} (当前: {}, 第{}次)",
                id, transition.from, transition.to, entry.task.status, entry.task.attempt_count
            );
            return Ok(false);
        }

        let key = entry.pending_key();
        entry.task.apply(transition)?;

        if transition.from == TaskStatus::Pending {
            table.pending.remove(&key);
        }
        if transition.to == TaskStatus::Pending {
            table.pending.insert(key, id.to_string());
        }

        Ok(true)
    }

    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut table = self.table.write().await;
        let entry = table
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;

        if entry.task.status.is_terminal() {
            return Ok(false);
        }

        if !entry.task.cancel_requested {
            entry.task.cancel_requested = true;
            entry.task.cancel_requested_at = Some(at);
            entry.task.updated_at = at;
        }
        Ok(true)
    }

    async fn get_pending_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Task>> {
        let table = self.table.read().await;
        let candidates = table
            .pending
            .values()
            .filter_map(|id| table.tasks.get(id))
            .filter(|entry| entry.task.is_ready(now))
            .take(limit)
            .map(|entry| entry.task.clone())
            .collect();
        Ok(candidates)
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let table = self.table.read().await;
        let mut entries: Vec<&TaskEntry> = table
            .tasks
            .values()
            .filter(|entry| filter.status.map_or(true, |s| entry.task.status == s))
            .filter(|entry| {
                filter.worker_id.as_deref().map_or(true, |w| {
                    entry.task.assigned_worker_id.as_deref() == Some(w)
                })
            })
            .collect();
        entries.sort_by_key(|entry| (entry.task.created_at, entry.seq));

        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.task.clone())
            .collect())
    }

    async fn count_by_status(&self) -> SchedulerResult<TaskStatusSummary> {
        let table = self.table.read().await;
        let mut summary = TaskStatusSummary::default();
        for entry in table.tasks.values() {
            summary.add(entry.task.status, 1);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use taskpool_core::models::{ErrorType, TaskSubmission};

    fn task(priority: i32) -> Task {
        Task::new(
            TaskSubmission::new("chat", json!({"prompt": "hi"})).with_priority(priority),
            1,
        )
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_priority_then_fifo() {
        let repo = InMemoryTaskRepository::new();
        let low = repo.create(&task(1)).await.unwrap();
        let high = repo.create(&task(10)).await.unwrap();
        let low_later = repo.create(&task(1)).await.unwrap();

        let ids: Vec<String> = repo
            .get_pending_candidates(Utc::now(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![high.id, low.id, low_later.id]);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let repo = InMemoryTaskRepository::new();
        let t = repo.create(&task(0)).await.unwrap();
        let now = Utc::now();

        assert!(repo
            .transition(&t.id, &TaskTransition::assign("w-1", now))
            .await
            .unwrap());
        // 第二个分派者看到的已不是 PENDING
        assert!(!repo
            .transition(&t.id, &TaskTransition::assign("w-2", now))
            .await
            .unwrap());

        let stored = repo.get_by_id(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("w-1"));
        assert_eq!(stored.attempt_count, 1);
        assert!(repo
            .get_pending_candidates(now, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_invalid_edge_rejected() {
        let repo = InMemoryTaskRepository::new();
        let t = repo.create(&task(0)).await.unwrap();

        let result = repo
            .transition(&t.id, &TaskTransition::succeed(0, json!({}), Utc::now()))
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidTaskTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_requeued_task_waits_for_backoff() {
        let repo = InMemoryTaskRepository::new();
        let t = repo.create(&task(0)).await.unwrap();
        let now = Utc::now();

        repo.transition(&t.id, &TaskTransition::assign("w-1", now))
            .await
            .unwrap();
        repo.transition(&t.id, &TaskTransition::start(1, now + Duration::seconds(60), now))
            .await
            .unwrap();
        let not_before = now + Duration::seconds(5);
        assert!(repo
            .transition(
                &t.id,
                &TaskTransition::requeue(1, Some(not_before), ErrorType::Network, "reset", now),
            )
            .await
            .unwrap());

        assert!(repo
            .get_pending_candidates(now, 10)
            .await
            .unwrap()
            .is_empty());
        let ready = repo
            .get_pending_candidates(not_before, 10)
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_stale_attempt_is_ignored() {
        let repo = InMemoryTaskRepository::new();
        let t = repo.create(&task(0)).await.unwrap();
        let now = Utc::now();

        repo.transition(&t.id, &TaskTransition::assign("w-1", now))
            .await
            .unwrap();
        repo.transition(&t.id, &TaskTransition::start(1, now, now))
            .await
            .unwrap();

        assert!(!repo
            .transition(&t.id, &TaskTransition::succeed(2, json!({}), now))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_request_cancel() {
        let repo = InMemoryTaskRepository::new();
        let t = repo.create(&task(0)).await.unwrap();

        assert!(repo.request_cancel(&t.id, Utc::now()).await.unwrap());
        let stored = repo.get_by_id(&t.id).await.unwrap().unwrap();
        assert!(stored.cancel_requested);
        assert_eq!(stored.status, TaskStatus::Pending);

        assert!(matches!(
            repo.request_cancel("missing", Utc::now()).await,
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }
}
