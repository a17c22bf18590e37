use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use taskpool_core::{models::WorkerMetric, traits::WorkerMetricRepository, SchedulerResult};

use crate::database::mapping::MappingHelpers;

const METRIC_COLUMNS: &str = "worker_id, task_id, execution_time_ms, tokens_processed, \
     prompt_length, output_length, success, error_type, measured_at";

pub struct SqliteWorkerMetricRepository {
    pool: SqlitePool,
}

impl SqliteWorkerMetricRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_metric(row: &SqliteRow) -> SchedulerResult<WorkerMetric> {
        Ok(WorkerMetric {
            worker_id: row.try_get("worker_id")?,
            task_id: row.try_get("task_id")?,
            execution_time_ms: row.try_get("execution_time_ms")?,
            tokens_processed: row.try_get("tokens_processed")?,
            prompt_length: row.try_get("prompt_length")?,
            output_length: row.try_get("output_length")?,
            success: row.try_get("success")?,
            error_type: MappingHelpers::parse_optional_enum(row, "error_type")?,
            measured_at: row.try_get("measured_at")?,
        })
    }
}

#[async_trait]
impl WorkerMetricRepository for SqliteWorkerMetricRepository {
    async fn insert(&self, metric: &WorkerMetric) -> SchedulerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO worker_metrics ({METRIC_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&metric.worker_id)
        .bind(&metric.task_id)
        .bind(metric.execution_time_ms)
        .bind(metric.tokens_processed)
        .bind(metric.prompt_length)
        .bind(metric.output_length)
        .bind(metric.success)
        .bind(metric.error_type.map(|e| e.as_str()))
        .bind(metric.measured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_worker(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<WorkerMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM worker_metrics WHERE worker_id = ? \
             ORDER BY measured_at DESC, id DESC LIMIT ?"
        ))
        .bind(worker_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_metric).collect()
    }

    async fn list_since(&self, since: DateTime<Utc>) -> SchedulerResult<Vec<WorkerMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM worker_metrics WHERE measured_at >= ? \
             ORDER BY measured_at ASC, id ASC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_metric).collect()
    }
}
