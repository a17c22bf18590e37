use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ErrorType, Task, TaskStatus};

/// 转发给Worker的任务执行消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecutionMessage {
    pub task_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub timeout_seconds: i64,
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskExecutionMessage {
    pub fn from_task(task: &Task, timeout_seconds: i64) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            attempt: task.attempt_count,
            timeout_seconds,
            deadline: task.deadline,
        }
    }
}

/// Worker上报的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded {
        result: serde_json::Value,
    },
    Failed {
        error_type: ErrorType,
        message: String,
        /// 为 false 时任务直接失败，不消耗重试次数
        #[serde(default = "default_retryable")]
        retryable: bool,
    },
    /// Worker确认已停止执行
    Cancelled,
}

fn default_retryable() -> bool {
    true
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            TaskOutcome::Succeeded { .. } => None,
            TaskOutcome::Failed { error_type, .. } => Some(*error_type),
            TaskOutcome::Cancelled => Some(ErrorType::Cancelled),
        }
    }
}

/// 随执行结果一起上报的指标
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetrics {
    pub worker_id: String,
    /// 回显 [`TaskExecutionMessage::attempt`]，用于识别过期的上报
    #[serde(default)]
    pub attempt: Option<i32>,
    pub execution_time_ms: i64,
    #[serde(default)]
    pub tokens_processed: i64,
    #[serde(default)]
    pub prompt_length: i64,
    #[serde(default)]
    pub output_length: i64,
}

impl ExecutionMetrics {
    pub fn new(worker_id: impl Into<String>, execution_time_ms: i64) -> Self {
        Self {
            worker_id: worker_id.into(),
            execution_time_ms,
            ..Default::default()
        }
    }

    pub fn for_attempt(mut self, attempt: i32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_tokens(mut self, tokens_processed: i64) -> Self {
        self.tokens_processed = tokens_processed;
        self
    }

    pub fn with_lengths(mut self, prompt_length: i64, output_length: i64) -> Self {
        self.prompt_length = prompt_length;
        self.output_length = output_length;
        self
    }
}

/// 健康检查响应
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProbeResponse {
    pub ok: bool,
    pub latency_ms: f64,
}

/// 任务状态统计
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatusSummary {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStatusSummary {
    pub fn add(&mut self, status: TaskStatus, count: usize) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Assigned => self.assigned += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Succeeded => self.succeeded += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.running + self.succeeded + self.failed + self.cancelled
    }

    pub fn in_flight(&self) -> usize {
        self.assigned + self.running
    }

    pub fn active(&self) -> usize {
        self.pending + self.in_flight()
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_wire_format() {
        let outcome: TaskOutcome = serde_json::from_value(json!({
            "outcome": "failed",
            "error_type": "network",
            "message": "upstream closed"
        }))
        .unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                error_type: ErrorType::Network,
                message: "upstream closed".to_string(),
                retryable: true,
            }
        );

        let outcome: TaskOutcome =
            serde_json::from_value(json!({"outcome": "succeeded", "result": {"text": "ok"}}))
                .unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = TaskStatusSummary::default();
        summary.add(TaskStatus::Pending, 3);
        summary.add(TaskStatus::Running, 2);
        summary.add(TaskStatus::Failed, 1);
        assert_eq!(summary.total(), 6);
        assert_eq!(summary.in_flight(), 2);
        assert_eq!(summary.active(), 5);
        assert_eq!(summary.finished(), 1);
    }
}
