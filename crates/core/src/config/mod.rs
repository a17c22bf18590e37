//! 配置管理
//!
//! 配置按以下顺序合并，后者覆盖前者：
//!
//! 1. 内置默认值
//! 2. TOML配置文件
//! 3. 环境变量（前缀 `TASKPOOL_`，层级之间用 `__` 分隔，
//!    例如 `TASKPOOL_HEALTH__DEAD_THRESHOLD=5`）
//!
//! 每个配置段都提供 `validate()`，加载完成后统一校验。

pub mod models;

pub use models::*;
