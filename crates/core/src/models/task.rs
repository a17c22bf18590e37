use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SchedulerError, SchedulerResult};

/// 任务定义
///
/// 表示一次生成请求，从提交开始一直保留到外部保留策略将其归档。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符（UUID）
/// - `task_type`: 任务类型，决定超时时间和可用的Worker
/// - `payload`: 任务负载，包含提示词等参数
/// - `priority`: 优先级，数值越大越紧急
/// - `assigned_worker_id`: 当前持有该任务的Worker
/// - `sync`: 调用方是否同步等待结果
/// - `attempt_count`: 已分配执行的次数，只增不减
/// - `max_retries`: 失败后允许重新排队的次数
/// - `not_before`: 重试退避期间，早于该时间不会再次分配
/// - `deadline`: 当前这次执行的超时时间点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_worker_id: Option<String>,
    pub sync: bool,
    pub attempt_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务状态
///
/// ```text
/// PENDING → ASSIGNED → RUNNING → SUCCEEDED | FAILED | CANCELLED
///    ↑                    │
///    └──────(重试)────────┘
/// PENDING → CANCELLED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 任务是否占用着某个Worker的并发槽位
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_lowercase())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid task status: {s}"
            ))),
        }
    }
}

/// 失败原因分类，写入 `Task.error_type` 和 `WorkerMetric.error_type`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// 执行超过了任务的超时时间
    Timeout,
    /// 与Worker通信失败
    Network,
    /// Worker报告的可重试错误
    WorkerError,
    /// Worker在执行过程中被判定为失效
    WorkerLost,
    /// Worker下线排空超时
    DrainTimeout,
    /// 任务输入无效
    InvalidInput,
    /// 任务类型不受支持
    UnsupportedTaskType,
    /// 取消确认
    Cancelled,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::Network => "network",
            ErrorType::WorkerError => "worker_error",
            ErrorType::WorkerLost => "worker_lost",
            ErrorType::DrainTimeout => "drain_timeout",
            ErrorType::InvalidInput => "invalid_input",
            ErrorType::UnsupportedTaskType => "unsupported_task_type",
            ErrorType::Cancelled => "cancelled",
        }
    }

    /// 致命错误不消耗重试次数，任务直接失败
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorType::InvalidInput | ErrorType::UnsupportedTaskType
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ErrorType::Timeout),
            "network" => Ok(ErrorType::Network),
            "worker_error" => Ok(ErrorType::WorkerError),
            "worker_lost" => Ok(ErrorType::WorkerLost),
            "drain_timeout" => Ok(ErrorType::DrainTimeout),
            "invalid_input" => Ok(ErrorType::InvalidInput),
            "unsupported_task_type" => Ok(ErrorType::UnsupportedTaskType),
            "cancelled" => Ok(ErrorType::Cancelled),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid error type: {s}"
            ))),
        }
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: 0,
            sync: false,
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// 一次状态转换，由仓储以比较并交换的方式应用
///
/// 只有当任务当前处于 `from` 状态（且 `expected_attempt` 匹配时）才会生效。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub expected_attempt: Option<i32>,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub not_before: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl TaskTransition {
    fn new(from: TaskStatus, to: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            expected_attempt: None,
            worker_id: None,
            result: None,
            error: None,
            error_type: None,
            not_before: None,
            deadline: None,
            at,
        }
    }

    pub fn assign(worker_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut t = Self::new(TaskStatus::Pending, TaskStatus::Assigned, at);
        t.worker_id = Some(worker_id.into());
        t
    }

    pub fn start(attempt: i32, deadline: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        let mut t = Self::new(TaskStatus::Assigned, TaskStatus::Running, at);
        t.expected_attempt = Some(attempt);
        t.deadline = Some(deadline);
        t
    }

    pub fn requeue(
        attempt: i32,
        not_before: Option<DateTime<Utc>>,
        error_type: ErrorType,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut t = Self::new(TaskStatus::Running, TaskStatus::Pending, at);
        t.expected_attempt = Some(attempt);
        t.not_before = not_before;
        t.error_type = Some(error_type);
        t.error = Some(error.into());
        t
    }

    pub fn succeed(attempt: i32, result: serde_json::Value, at: DateTime<Utc>) -> Self {
        let mut t = Self::new(TaskStatus::Running, TaskStatus::Succeeded, at);
        t.expected_attempt = Some(attempt);
        t.result = Some(result);
        t
    }

    pub fn fail(
        attempt: i32,
        error_type: ErrorType,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut t = Self::new(TaskStatus::Running, TaskStatus::Failed, at);
        t.expected_attempt = Some(attempt);
        t.error_type = Some(error_type);
        t.error = Some(error.into());
        t
    }

    pub fn cancel(from: TaskStatus, at: DateTime<Utc>) -> Self {
        Self::new(from, TaskStatus::Cancelled, at)
    }

    pub fn with_expected_attempt(mut self, attempt: i32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }
}

/// 任务过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub worker_id: Option<String>,
    pub limit: Option<i64>,
}

impl Task {
    /// 根据提交请求创建新任务
    pub fn new(submission: TaskSubmission, default_max_retries: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: submission.task_type,
            payload: submission.payload,
            priority: submission.priority,
            status: TaskStatus::Pending,
            assigned_worker_id: None,
            sync: submission.sync,
            attempt_count: 0,
            max_retries: submission.max_retries.unwrap_or(default_max_retries),
            timeout_seconds: submission.timeout_seconds,
            cancel_requested: false,
            cancel_requested_at: None,
            not_before: None,
            deadline: None,
            started_at: None,
            result: None,
            error: None,
            error_type: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 任务在 `now` 时刻是否可以被分配
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// 本次失败后是否还能重新排队
    ///
    /// `attempt_count` 在分配时递增，因此第 `max_retries + 1` 次执行失败后不再重试。
    pub fn can_retry(&self) -> bool {
        self.attempt_count <= self.max_retries
    }

    /// 比较并交换的前置条件
    pub fn matches(&self, transition: &TaskTransition) -> bool {
        self.status == transition.from
            && transition
                .expected_attempt
                .map_or(true, |attempt| attempt == self.attempt_count)
    }

    /// 在内存中应用状态转换
    pub fn apply(&mut self, transition: &TaskTransition) -> SchedulerResult<()> {
        if !self.status.can_transition_to(transition.to) {
            return Err(SchedulerError::InvalidTaskTransition {
                id: self.id.clone(),
                from: self.status,
                to: transition.to,
            });
        }

        self.status = transition.to;
        self.updated_at = transition.at;

        match transition.to {
            TaskStatus::Assigned => {
                self.assigned_worker_id = transition.worker_id.clone();
                self.attempt_count += 1;
                self.not_before = None;
            }
            TaskStatus::Running => {
                self.deadline = transition.deadline;
                self.started_at = Some(transition.at);
            }
            TaskStatus::Pending => {
                self.assigned_worker_id = None;
                self.deadline = None;
                self.started_at = None;
                self.not_before = transition.not_before;
                self.error = transition.error.clone();
                self.error_type = transition.error_type;
            }
            TaskStatus::Succeeded => {
                self.deadline = None;
                self.result = transition.result.clone();
                self.error = None;
                self.error_type = None;
            }
            TaskStatus::Failed => {
                self.deadline = None;
                self.error = transition.error.clone();
                self.error_type = transition.error_type;
            }
            TaskStatus::Cancelled => {
                self.deadline = None;
                self.not_before = None;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_task() -> Task {
        Task::new(TaskSubmission::new("chat", json!({"prompt": "hi"})), 1)
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Assigned.can_transition_to(Succeeded));
        for terminal in [Succeeded, Failed, Cancelled] {
            for to in [Pending, Assigned, Running, Succeeded, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_apply_assign_and_requeue() {
        let mut task = pending_task();
        let now = Utc::now();

        task.apply(&TaskTransition::assign("w1", now)).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_worker_id.as_deref(), Some("w1"));
        assert_eq!(task.attempt_count, 1);

        task.apply(&TaskTransition::start(1, now, now)).unwrap();
        task.apply(&TaskTransition::requeue(
            1,
            Some(now),
            ErrorType::Network,
            "connection reset",
            now,
        ))
        .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_worker_id.is_none());
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.error_type, Some(ErrorType::Network));
    }

    #[test]
    fn test_apply_rejects_skipping_running() {
        let mut task = pending_task();
        let err = task
            .apply(&TaskTransition::succeed(0, json!({}), Utc::now()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTaskTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_matches_checks_attempt() {
        let mut task = pending_task();
        let now = Utc::now();
        task.apply(&TaskTransition::assign("w1", now)).unwrap();
        task.apply(&TaskTransition::start(1, now, now)).unwrap();

        assert!(task.matches(&TaskTransition::succeed(1, json!({}), now)));
        assert!(!task.matches(&TaskTransition::succeed(2, json!({}), now)));
        assert!(!task.matches(&TaskTransition::assign("w2", now)));
    }

    #[test]
    fn test_can_retry_counts_first_attempt() {
        let mut task = pending_task();
        task.max_retries = 1;
        task.attempt_count = 1;
        assert!(task.can_retry());
        task.attempt_count = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_is_ready_respects_backoff() {
        let mut task = pending_task();
        let now = Utc::now();
        assert!(task.is_ready(now));
        task.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!task.is_ready(now));
        assert!(task.is_ready(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_status_parse_round_trip() {
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert_eq!("timeout".parse::<ErrorType>().unwrap(), ErrorType::Timeout);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
