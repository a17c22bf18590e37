use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use taskpool_core::{
    models::{WorkerHealthUpdate, WorkerInfo, WorkerStatus},
    traits::WorkerRepository,
    SchedulerError, SchedulerResult,
};

use crate::database::mapping::MappingHelpers;

const WORKER_COLUMNS: &str = "id, location, endpoint_url, performance_factor, network_latency_ms, \
     status, max_concurrent_tasks, current_task_count, supported_task_types, \
     consecutive_failures, last_health_check, last_assigned_at, registered_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker_info(row: &SqliteRow) -> SchedulerResult<WorkerInfo> {
        let consecutive_failures: i64 = row.try_get("consecutive_failures")?;
        Ok(WorkerInfo {
            id: row.try_get("id")?,
            location: MappingHelpers::parse_enum(row, "location")?,
            endpoint_url: row.try_get("endpoint_url")?,
            performance_factor: row.try_get("performance_factor")?,
            network_latency_ms: row.try_get("network_latency_ms")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            current_task_count: row.try_get("current_task_count")?,
            supported_task_types: MappingHelpers::parse_string_list(row, "supported_task_types")?,
            consecutive_failures: u32::try_from(consecutive_failures).unwrap_or(0),
            last_health_check: row.try_get("last_health_check")?,
            last_assigned_at: row.try_get("last_assigned_at")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    async fn require_exists(&self, worker_id: &str) -> SchedulerResult<()> {
        let row = sqlx::query("SELECT 1 FROM workers WHERE id = ?")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(_) => Ok(()),
            None => Err(SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    async fn fetch(&self, sql: &str, status: Option<WorkerStatus>) -> SchedulerResult<Vec<WorkerInfo>> {
        let mut query = sqlx::query(sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker_info).collect()
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn register(&self, worker: &WorkerInfo) -> SchedulerResult<bool> {
        let supported_task_types_json = serde_json::to_string(&worker.supported_task_types)
            .map_err(|e| SchedulerError::Serialization(format!("序列化任务类型列表失败: {e}")))?;

        // 只有已失效或已注销的同ID记录会被覆盖
        let result = sqlx::query(
            r#"
            INSERT INTO workers (id, location, endpoint_url, performance_factor, network_latency_ms,
                status, max_concurrent_tasks, current_task_count, supported_task_types,
                consecutive_failures, last_health_check, last_assigned_at, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                location = excluded.location,
                endpoint_url = excluded.endpoint_url,
                performance_factor = excluded.performance_factor,
                network_latency_ms = excluded.network_latency_ms,
                status = excluded.status,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                current_task_count = excluded.current_task_count,
                supported_task_types = excluded.supported_task_types,
                consecutive_failures = excluded.consecutive_failures,
                last_health_check = excluded.last_health_check,
                last_assigned_at = excluded.last_assigned_at,
                registered_at = excluded.registered_at
            WHERE workers.status IN ('DEAD', 'REMOVED')
            "#,
        )
        .bind(&worker.id)
        .bind(worker.location.as_str())
        .bind(&worker.endpoint_url)
        .bind(worker.performance_factor)
        .bind(worker.network_latency_ms)
        .bind(worker.status.as_str())
        .bind(worker.max_concurrent_tasks)
        .bind(worker.current_task_count)
        .bind(supported_task_types_json)
        .bind(i64::from(worker.consecutive_failures))
        .bind(worker.last_health_check)
        .bind(worker.last_assigned_at)
        .bind(worker.registered_at)
        .execute(&self.pool)
        .await?;

        let registered = result.rows_affected() > 0;
        if registered {
            debug!("注册Worker成功: {}", worker.id);
        }
        Ok(registered)
    }

    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<WorkerInfo>> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?"))
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_worker_info).transpose()
    }

    async fn list(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        self.fetch(
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers WHERE status != 'REMOVED' \
                 ORDER BY registered_at ASC, id ASC"
            ),
            None,
        )
        .await
    }

    async fn get_by_status(&self, status: WorkerStatus) -> SchedulerResult<Vec<WorkerInfo>> {
        self.fetch(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE status = ? ORDER BY id ASC"),
            Some(status),
        )
        .await
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

        let result = sqlx::query("UPDATE workers SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(worker_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            self.require_exists(worker_id).await?;
            return Ok(false);
        }
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

        let result = sqlx::query(
            "UPDATE workers SET status = ?, network_latency_ms = COALESCE(?, network_latency_ms), \
             consecutive_failures = ?, last_health_check = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(update.status.as_str())
        .bind(update.network_latency_ms)
        .bind(i64::from(update.consecutive_failures))
        .bind(update.checked_at)
        .bind(worker_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_exists(worker_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn update_performance_factor(
        &self,
        worker_id: &str,
        factor: f64,
    ) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE workers SET performance_factor = ? WHERE id = ?")
            .bind(factor)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            self.require_exists(worker_id).await?;
        }
        Ok(())
    }

    async fn adjust_task_count(&self, worker_id: &str, delta: i32) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET current_task_count = MAX(current_task_count + ?, 0) WHERE id = ?",
        )
        .bind(delta)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.require_exists(worker_id).await?;
        }
        Ok(())
    }

    async fn record_assignment(&self, worker_id: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE workers SET last_assigned_at = ? WHERE id = ?")
            .bind(at)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            self.require_exists(worker_id).await?;
        }
        Ok(())
    }
}
