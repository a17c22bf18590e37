//! # 数据模型
//!
//! 任务分发系统的三类持久化实体及其辅助类型：
//!
//! - [`Task`] - 调用方提交的一次生成任务
//! - [`WorkerInfo`] - 本地或远程的执行节点
//! - [`WorkerMetric`] - 每次执行的指标记录，只追加
//!
//! ## 状态管理
//!
//! 状态转换规则集中在 [`TaskStatus::can_transition_to`] 和
//! [`WorkerStatus::can_transition_to`]，仓储实现和调度逻辑都以此为准。
//!
//! ## 数据库映射
//!
//! - `tasks` - 任务
//! - `workers` - Worker节点
//! - `worker_metrics` - 执行指标，外键关联 `tasks` 与 `workers`

pub mod message;
pub mod metric;
pub mod task;
pub mod worker;

pub use message::*;
pub use metric::*;
pub use task::*;
pub use worker::*;
