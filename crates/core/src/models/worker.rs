use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// Worker节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub location: WorkerLocation,
    pub endpoint_url: String,
    pub performance_factor: f64,
    pub network_latency_ms: Option<f64>,
    pub status: WorkerStatus,
    pub max_concurrent_tasks: i32,
    pub current_task_count: i32,
    /// 为空表示接受任意任务类型
    pub supported_task_types: Vec<String>,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Worker部署位置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLocation {
    Local,
    Remote,
}

impl WorkerLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerLocation::Local => "local",
            WorkerLocation::Remote => "remote",
        }
    }
}

impl FromStr for WorkerLocation {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(WorkerLocation::Local),
            "remote" => Ok(WorkerLocation::Remote),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid worker location: {s}"
            ))),
        }
    }
}

/// Worker状态
///
/// ```text
/// (注册) → ACTIVE → SUSPECT → DEAD
///            ↑         │
///            └─────────┘
/// ACTIVE → DRAINING → REMOVED
/// ```
///
/// DEAD 的Worker不能直接恢复为 ACTIVE，必须重新注册。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "SUSPECT")]
    Suspect,
    #[serde(rename = "DEAD")]
    Dead,
    #[serde(rename = "DRAINING")]
    Draining,
    #[serde(rename = "REMOVED")]
    Removed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "ACTIVE",
            WorkerStatus::Suspect => "SUSPECT",
            WorkerStatus::Dead => "DEAD",
            WorkerStatus::Draining => "DRAINING",
            WorkerStatus::Removed => "REMOVED",
        }
    }

    pub fn can_transition_to(&self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, to) {
            (Active, Suspect) | (Suspect, Active) | (Suspect, Dead) | (Active, Draining) => true,
            // 注销可以发生在任何仍在册的状态
            (from, Removed) => *from != Removed,
            _ => false,
        }
    }

    /// 已注销或已失效的Worker可以用同一个ID重新注册
    pub fn allows_reregistration(&self) -> bool {
        matches!(self, WorkerStatus::Dead | WorkerStatus::Removed)
    }

    /// 健康检查只针对仍可能恢复或仍在执行任务的Worker
    pub fn is_probed(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Active | WorkerStatus::Suspect | WorkerStatus::Draining
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_lowercase())
    }
}

impl FromStr for WorkerStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(WorkerStatus::Active),
            "SUSPECT" => Ok(WorkerStatus::Suspect),
            "DEAD" => Ok(WorkerStatus::Dead),
            "DRAINING" => Ok(WorkerStatus::Draining),
            "REMOVED" => Ok(WorkerStatus::Removed),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid worker status: {s}"
            ))),
        }
    }
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub location: WorkerLocation,
    pub endpoint_url: String,
    pub max_concurrent_tasks: i32,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
    #[serde(default)]
    pub performance_factor: Option<f64>,
}

impl WorkerRegistration {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.worker_id.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "Worker ID不能为空".to_string(),
            ));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "Worker {} 的地址不能为空",
                self.worker_id
            )));
        }
        if self.max_concurrent_tasks <= 0 {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "Worker {} 的最大并发任务数必须大于0",
                self.worker_id
            )));
        }
        if let Some(factor) = self.performance_factor {
            if !factor.is_finite() || factor < 0.0 {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "Worker {} 的性能系数必须是非负数",
                    self.worker_id
                )));
            }
        }
        Ok(())
    }
}

/// 健康检查后写回的字段
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHealthUpdate {
    pub status: WorkerStatus,
    pub network_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

impl WorkerInfo {
    /// 创建新的Worker信息
    pub fn new(registration: WorkerRegistration) -> Self {
        Self {
            id: registration.worker_id,
            location: registration.location,
            endpoint_url: registration.endpoint_url,
            performance_factor: registration.performance_factor.unwrap_or(1.0),
            network_latency_ms: None,
            status: WorkerStatus::Active,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_task_count: 0,
            supported_task_types: registration.supported_task_types,
            consecutive_failures: 0,
            last_health_check: None,
            last_assigned_at: None,
            registered_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_task_types.is_empty()
            || self.supported_task_types.iter().any(|t| t == task_type)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_task_count < self.max_concurrent_tasks
    }

    /// 检查Worker是否可以接受新任务
    pub fn can_accept_task(&self, task_type: &str) -> bool {
        self.is_active() && self.has_capacity() && self.supports(task_type)
    }

    /// 获取Worker负载率
    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            0.0
        } else {
            (self.current_task_count as f64 / self.max_concurrent_tasks as f64) * 100.0
        }
    }
}
