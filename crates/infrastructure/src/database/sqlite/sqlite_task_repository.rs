use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use taskpool_core::{
    models::{Task, TaskFilter, TaskStatus, TaskStatusSummary, TaskTransition},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "id, task_type, payload, priority, status, assigned_worker_id, sync, \
     attempt_count, max_retries, timeout_seconds, cancel_requested, cancel_requested_at, \
     not_before, deadline, started_at, result, error, error_type, created_at, updated_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: MappingHelpers::parse_json(row, "payload")?,
            priority: row.try_get("priority")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            assigned_worker_id: row.try_get("assigned_worker_id")?,
            sync: row.try_get("sync")?,
            attempt_count: row.try_get("attempt_count")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            cancel_requested: row.try_get("cancel_requested")?,
            cancel_requested_at: row.try_get("cancel_requested_at")?,
            not_before: row.try_get("not_before")?,
            deadline: row.try_get("deadline")?,
            started_at: row.try_get("started_at")?,
            result: MappingHelpers::parse_optional_json(row, "result")?,
            error: row.try_get("error")?,
            error_type: MappingHelpers::parse_optional_enum(row, "error_type")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn exists(&self, id: &str) -> SchedulerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let payload = serde_json::to_string(&task.payload)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, priority, status, assigned_worker_id, sync,
                attempt_count, max_retries, timeout_seconds, cancel_requested, cancel_requested_at,
                not_before, deadline, started_at, result, error, error_type, created_at, updated_at,
                seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM tasks))
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(payload)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(&task.assigned_worker_id)
        .bind(task.sync)
        .bind(task.attempt_count)
        .bind(task.max_retries)
        .bind(task.timeout_seconds)
        .bind(task.cancel_requested)
        .bind(task.cancel_requested_at)
        .bind(task.not_before)
        .bind(task.deadline)
        .bind(task.started_at)
        .bind(result)
        .bind(&task.error)
        .bind(task.error_type.map(|e| e.as_str()))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("创建任务: {} ({})", task.id, task.task_type);
        Ok(task.clone())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn transition(&self, id: &str, transition: &TaskTransition) -> SchedulerResult<bool> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(SchedulerError::InvalidTaskTransition {
                id: id.to_string(),
                from: transition.from,
                to: transition.to,
            });
        }

        let result_json = transition
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error_type = transition.error_type.map(|e| e.as_str());

        // 每条语句的 WHERE 条件相同：id、当前状态、可选的执行次数
        let query = match transition.to {
            TaskStatus::Assigned => sqlx::query(
                "UPDATE tasks SET status = 'ASSIGNED', assigned_worker_id = ?, \
                 attempt_count = attempt_count + 1, not_before = NULL, updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(&transition.worker_id)
            .bind(transition.at),
            TaskStatus::Running => sqlx::query(
                "UPDATE tasks SET status = 'RUNNING', deadline = ?, started_at = ?, updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(transition.deadline)
            .bind(transition.at)
            .bind(transition.at),
            TaskStatus::Pending => sqlx::query(
                "UPDATE tasks SET status = 'PENDING', assigned_worker_id = NULL, deadline = NULL, \
                 started_at = NULL, not_before = ?, error = ?, error_type = ?, updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(transition.not_before)
            .bind(&transition.error)
            .bind(error_type)
            .bind(transition.at),
            TaskStatus::Succeeded => sqlx::query(
                "UPDATE tasks SET status = 'SUCCEEDED', deadline = NULL, result = ?, error = NULL, \
                 error_type = NULL, updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(result_json)
            .bind(transition.at),
            TaskStatus::Failed => sqlx::query(
                "UPDATE tasks SET status = 'FAILED', deadline = NULL, error = ?, error_type = ?, \
                 updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(&transition.error)
            .bind(error_type)
            .bind(transition.at),
            TaskStatus::Cancelled => sqlx::query(
                "UPDATE tasks SET status = 'CANCELLED', deadline = NULL, not_before = NULL, \
                 updated_at = ? \
                 WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)",
            )
            .bind(transition.at),
        };

        let result = query
            .bind(id)
            .bind(transition.from.as_str())
            .bind(transition.expected_attempt)
            .bind(transition.expected_attempt)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        if !self.exists(id).await? {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        debug!(
            "任务 {} 状态已变化，放弃转换 {} -> {}",
            id, transition.from, transition.to
        );
        Ok(false)
    }

    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET cancel_requested = 1, \
             cancel_requested_at = COALESCE(cancel_requested_at, ?), updated_at = ? \
             WHERE id = ? AND status IN ('PENDING', 'ASSIGNED', 'RUNNING')",
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(false)
    }

    async fn get_pending_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'PENDING' AND (not_before IS NULL OR not_before <= ?) \
             ORDER BY priority DESC, created_at ASC, seq ASC LIMIT ?"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(worker_id) = &filter.worker_id {
            builder
                .push(" AND assigned_worker_id = ")
                .push_bind(worker_id.clone());
        }
        builder.push(" ORDER BY created_at ASC, seq ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_status(&self) -> SchedulerResult<TaskStatusSummary> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut summary = TaskStatusSummary::default();
        for row in &rows {
            let status: TaskStatus = MappingHelpers::parse_enum(row, "status")?;
            let count: i64 = row.try_get("count")?;
            summary.add(status, count.max(0) as usize);
        }
        Ok(summary)
    }
}
