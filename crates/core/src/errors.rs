use thiserror::Error;

use crate::models::{TaskStatus, WorkerStatus};

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移错误: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("Worker已注册: {id}")]
    DuplicateWorker { id: String },

    #[error("任务 {id} 的状态转换无效: {from} -> {to}")]
    InvalidTaskTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker {id} 的状态转换无效: {from} -> {to}")]
    InvalidWorkerTransition {
        id: String,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("不支持的任务类型: {0}")]
    UnsupportedTaskType(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("网络错误: {0}")]
    Network(String),

    #[error("Worker进程错误: {0}")]
    Process(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 输入本身有问题，重试也不会成功
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTaskParams(_) | SchedulerError::UnsupportedTaskType(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}
