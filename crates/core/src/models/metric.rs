use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ErrorType;

/// 单次执行的Worker指标，只追加、不修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetric {
    pub worker_id: String,
    pub task_id: String,
    pub execution_time_ms: i64,
    pub tokens_processed: i64,
    pub prompt_length: i64,
    pub output_length: i64,
    pub success: bool,
    pub error_type: Option<ErrorType>,
    pub measured_at: DateTime<Utc>,
}

impl WorkerMetric {
    /// 每秒处理的token数，执行时间为0时返回 None
    pub fn tokens_per_second(&self) -> Option<f64> {
        if self.execution_time_ms <= 0 {
            return None;
        }
        Some(self.tokens_processed as f64 * 1000.0 / self.execution_time_ms as f64)
    }
}
