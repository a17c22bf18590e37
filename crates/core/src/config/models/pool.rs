use serde::{Deserialize, Serialize};

/// 本地Worker池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// 待处理任务数与在途任务数之比超过该值时扩容
    pub scale_up_ratio: f64,
    /// 扩容条件需要持续的时间
    pub scale_up_window_seconds: u64,
    /// 本地Worker空闲超过该时间后缩容
    pub idle_window_seconds: u64,
    /// 两次扩缩容之间的最短间隔
    pub cooldown_seconds: u64,
    /// 缩容时等待在途任务完成的时间
    pub drain_grace_seconds: u64,
    pub check_interval_ms: u64,
    pub process: LocalProcessConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: 1,
            max_workers: 4,
            scale_up_ratio: 2.0,
            scale_up_window_seconds: 30,
            idle_window_seconds: 300,
            cooldown_seconds: 60,
            drain_grace_seconds: 120,
            check_interval_ms: 5000,
            process: LocalProcessConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.max_workers == 0 {
            return Err(anyhow::anyhow!("最大Worker数必须大于0"));
        }

        if self.min_workers > self.max_workers {
            return Err(anyhow::anyhow!("最小Worker数不能大于最大Worker数"));
        }

        if !(self.scale_up_ratio > 0.0) {
            return Err(anyhow::anyhow!("扩容比例必须大于0"));
        }

        if self.check_interval_ms == 0 {
            return Err(anyhow::anyhow!("池检查间隔必须大于0"));
        }

        self.process.validate()
    }
}

/// 本地Worker进程的启动方式
///
/// `args` 中的 `{port}` 和 `{worker_id}` 会在启动时替换。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub host: String,
    /// 第一个Worker使用的端口，后续依次递增
    pub base_port: u16,
    pub max_concurrent_tasks: i32,
    pub supported_task_types: Vec<String>,
}

impl Default for LocalProcessConfig {
    fn default() -> Self {
        Self {
            program: "taskpool-worker".to_string(),
            args: vec![
                "--port".to_string(),
                "{port}".to_string(),
                "--worker-id".to_string(),
                "{worker_id}".to_string(),
            ],
            host: "127.0.0.1".to_string(),
            base_port: 9100,
            max_concurrent_tasks: 1,
            supported_task_types: Vec::new(),
        }
    }
}

impl LocalProcessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker启动命令不能为空"));
        }

        if self.base_port == 0 {
            return Err(anyhow::anyhow!("Worker起始端口必须大于0"));
        }

        if self.max_concurrent_tasks <= 0 {
            return Err(anyhow::anyhow!("本地Worker的最大并发任务数必须大于0"));
        }

        Ok(())
    }
}
