//! 领域事件
//!
//! 任务和Worker的每一次状态变化都会发布一个事件，
//! 供日志、监控面板等外部订阅方使用。调度逻辑本身不依赖事件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskpool_core::models::{ErrorType, WorkerLocation, WorkerStatus};

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;
}

/// 任务相关事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: String,
        task_type: String,
        priority: i32,
    },
    Assigned {
        task_id: String,
        worker_id: String,
        attempt: i32,
    },
    Started {
        task_id: String,
        worker_id: String,
        attempt: i32,
        deadline: DateTime<Utc>,
    },
    Requeued {
        task_id: String,
        attempt: i32,
        error_type: ErrorType,
        not_before: Option<DateTime<Utc>>,
    },
    Succeeded {
        task_id: String,
        worker_id: String,
        attempt: i32,
    },
    Failed {
        task_id: String,
        attempt: i32,
        error_type: ErrorType,
    },
    CancelRequested {
        task_id: String,
    },
    Cancelled {
        task_id: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Submitted { task_id, .. }
            | TaskEvent::Assigned { task_id, .. }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Requeued { task_id, .. }
            | TaskEvent::Succeeded { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::CancelRequested { task_id }
            | TaskEvent::Cancelled { task_id } => task_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TaskEvent::Submitted { .. } => "TaskSubmitted",
            TaskEvent::Assigned { .. } => "TaskAssigned",
            TaskEvent::Started { .. } => "TaskStarted",
            TaskEvent::Requeued { .. } => "TaskRequeued",
            TaskEvent::Succeeded { .. } => "TaskSucceeded",
            TaskEvent::Failed { .. } => "TaskFailed",
            TaskEvent::CancelRequested { .. } => "TaskCancelRequested",
            TaskEvent::Cancelled { .. } => "TaskCancelled",
        }
    }
}

/// Worker相关事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Registered {
        worker_id: String,
        location: WorkerLocation,
    },
    StatusChanged {
        worker_id: String,
        from: WorkerStatus,
        to: WorkerStatus,
        consecutive_failures: u32,
    },
    PerformanceUpdated {
        worker_id: String,
        performance_factor: f64,
    },
    Deregistered {
        worker_id: String,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Registered { worker_id, .. }
            | WorkerEvent::StatusChanged { worker_id, .. }
            | WorkerEvent::PerformanceUpdated { worker_id, .. }
            | WorkerEvent::Deregistered { worker_id } => worker_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Registered { .. } => "WorkerRegistered",
            WorkerEvent::StatusChanged { .. } => "WorkerStatusChanged",
            WorkerEvent::PerformanceUpdated { .. } => "WorkerPerformanceUpdated",
            WorkerEvent::Deregistered { .. } => "WorkerDeregistered",
        }
    }
}

/// Worker池扩缩容事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScalingEvent {
    ScaledUp { worker_id: String, reason: String },
    DrainStarted { worker_id: String },
    Terminated { worker_id: String },
}

/// 事件内容
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PoolEventKind {
    Task(TaskEvent),
    Worker(WorkerEvent),
    Scaling(ScalingEvent),
    /// 队列深度信号，没有可用Worker时也会发布
    QueueDepth {
        pending: usize,
        in_flight: usize,
        stalled: usize,
    },
}

/// 事件总线上传递的事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: PoolEventKind,
}

impl PoolEvent {
    pub fn new(kind: PoolEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
        }
    }
}

impl From<TaskEvent> for PoolEventKind {
    fn from(event: TaskEvent) -> Self {
        PoolEventKind::Task(event)
    }
}

impl From<WorkerEvent> for PoolEventKind {
    fn from(event: WorkerEvent) -> Self {
        PoolEventKind::Worker(event)
    }
}

impl From<ScalingEvent> for PoolEventKind {
    fn from(event: ScalingEvent) -> Self {
        PoolEventKind::Scaling(event)
    }
}

impl DomainEvent for PoolEvent {
    fn event_id(&self) -> Uuid {
        self.id
    }

    fn event_type(&self) -> &str {
        match &self.kind {
            PoolEventKind::Task(event) => event.name(),
            PoolEventKind::Worker(event) => event.name(),
            PoolEventKind::Scaling(ScalingEvent::ScaledUp { .. }) => "PoolScaledUp",
            PoolEventKind::Scaling(ScalingEvent::DrainStarted { .. }) => "PoolDrainStarted",
            PoolEventKind::Scaling(ScalingEvent::Terminated { .. }) => "PoolWorkerTerminated",
            PoolEventKind::QueueDepth { .. } => "QueueDepth",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn aggregate_id(&self) -> String {
        match &self.kind {
            PoolEventKind::Task(event) => event.task_id().to_string(),
            PoolEventKind::Worker(event) => event.worker_id().to_string(),
            PoolEventKind::Scaling(
                ScalingEvent::ScaledUp { worker_id, .. }
                | ScalingEvent::DrainStarted { worker_id }
                | ScalingEvent::Terminated { worker_id },
            ) => worker_id.clone(),
            PoolEventKind::QueueDepth { .. } => "queue".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata() {
        let event = PoolEvent::new(
            WorkerEvent::StatusChanged {
                worker_id: "w-1".to_string(),
                from: WorkerStatus::Active,
                to: WorkerStatus::Suspect,
                consecutive_failures: 1,
            }
            .into(),
        );

        assert_eq!(event.event_type(), "WorkerStatusChanged");
        assert_eq!(event.aggregate_id(), "w-1");
    }

    #[test]
    fn test_event_serializes_with_tags() {
        let event = PoolEvent::new(
            TaskEvent::Failed {
                task_id: "t-1".to_string(),
                attempt: 2,
                error_type: ErrorType::Timeout,
            }
            .into(),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["kind"], "task");
        assert_eq!(json["kind"]["data"]["event"], "failed");
        assert_eq!(json["kind"]["data"]["error_type"], "timeout");
    }
}
