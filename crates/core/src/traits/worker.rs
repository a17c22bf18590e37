use async_trait::async_trait;

use crate::{
    models::{ProbeResponse, TaskExecutionMessage, WorkerInfo, WorkerRegistration},
    SchedulerResult,
};

/// 向Worker转发任务
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// 投递任务，Worker接收后即返回，执行结果通过 `report_result` 回报
    async fn dispatch(&self, worker: &WorkerInfo, message: &TaskExecutionMessage)
        -> SchedulerResult<()>;

    /// 尽力通知Worker停止执行
    async fn cancel(&self, worker: &WorkerInfo, task_id: &str) -> SchedulerResult<()>;
}

/// 健康检查探针
///
/// 超时由调用方控制，实现只负责一次请求。
#[async_trait]
pub trait WorkerProber: Send + Sync {
    async fn probe(&self, worker: &WorkerInfo) -> SchedulerResult<ProbeResponse>;
}

/// 本地Worker进程管理
///
/// 具体后端（操作系统进程、容器等）可替换。
#[async_trait]
pub trait WorkerProcessManager: Send + Sync {
    /// 启动一个新的Worker进程，返回用于注册的描述
    async fn spawn(&self) -> SchedulerResult<WorkerRegistration>;

    /// 终止Worker进程，进程已退出时也返回成功
    async fn terminate(&self, worker_id: &str) -> SchedulerResult<()>;

    fn backend_name(&self) -> &str;
}
