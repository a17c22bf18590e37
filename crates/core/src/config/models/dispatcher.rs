use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 分派策略: effective_score / load_based / round_robin
    pub strategy: String,
    /// 评分公式中的基准延迟
    pub base_latency_ms: f64,
    /// 尚未完成首次探测的Worker使用的假定延迟
    pub assumed_latency_ms: f64,
    /// 每个在途任务带来的评分惩罚
    pub load_penalty: f64,
    /// 每轮调度最多处理的待分配任务数
    pub batch_size: usize,
    /// 周期性巡检间隔（超时、取消宽限期、退避到期）
    pub sweep_interval_ms: u64,
    pub default_task_timeout_seconds: u64,
    /// 按任务类型覆盖超时时间
    pub task_timeouts: HashMap<String, u64>,
    /// 允许提交的任务类型，为空表示不限制
    pub task_types: Vec<String>,
    pub default_max_retries: i32,
    /// 取消请求发出后等待Worker确认的时间
    pub cancel_grace_seconds: u64,
    /// 向Worker投递任务的超时时间
    pub forward_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            strategy: "effective_score".to_string(),
            base_latency_ms: 100.0,
            assumed_latency_ms: 100.0,
            load_penalty: 0.25,
            batch_size: 32,
            sweep_interval_ms: 1000,
            default_task_timeout_seconds: 600,
            task_timeouts: HashMap::new(),
            task_types: Vec::new(),
            default_max_retries: 1,
            cancel_grace_seconds: 30,
            forward_timeout_ms: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_strategies = ["effective_score", "load_based", "round_robin"];
        if !valid_strategies.contains(&self.strategy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的分派策略: {}，支持的策略: {:?}",
                self.strategy,
                valid_strategies
            ));
        }

        if !(self.base_latency_ms > 0.0) {
            return Err(anyhow::anyhow!("基准延迟必须大于0"));
        }

        if !(self.assumed_latency_ms >= 0.0) {
            return Err(anyhow::anyhow!("假定延迟不能为负数"));
        }

        if !(self.load_penalty >= 0.0) {
            return Err(anyhow::anyhow!("负载惩罚系数不能为负数"));
        }

        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("调度批量大小必须大于0"));
        }

        if self.sweep_interval_ms == 0 {
            return Err(anyhow::anyhow!("巡检间隔必须大于0"));
        }

        if self.default_task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认任务超时时间必须大于0"));
        }

        if let Some((task_type, _)) = self.task_timeouts.iter().find(|(_, v)| **v == 0) {
            return Err(anyhow::anyhow!("任务类型 {} 的超时时间必须大于0", task_type));
        }

        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认重试次数不能为负数"));
        }

        if self.forward_timeout_ms == 0 {
            return Err(anyhow::anyhow!("任务投递超时时间必须大于0"));
        }

        Ok(())
    }

    /// 计算任务的单次执行超时（秒）
    pub fn timeout_for(&self, task_type: &str, task_override: Option<i64>) -> i64 {
        if let Some(seconds) = task_override.filter(|s| *s > 0) {
            return seconds;
        }
        self.task_timeouts
            .get(task_type)
            .copied()
            .unwrap_or(self.default_task_timeout_seconds) as i64
    }

    pub fn accepts_task_type(&self, task_type: &str) -> bool {
        self.task_types.is_empty() || self.task_types.iter().any(|t| t == task_type)
    }
}

/// 重试退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 第一次重试前的等待时间
    pub base_delay_ms: u64,
    /// 退避时间上限
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 抖动比例，0 表示不加抖动
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow::anyhow!("最大退避时间不能小于基础退避时间"));
        }

        if !(self.backoff_multiplier >= 1.0) {
            return Err(anyhow::anyhow!("退避倍数必须不小于1"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动比例必须在0到1之间"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_resolution() {
        let mut config = DispatcherConfig::default();
        config.task_timeouts.insert("summarize".to_string(), 120);

        assert_eq!(config.timeout_for("chat", None), 600);
        assert_eq!(config.timeout_for("summarize", None), 120);
        assert_eq!(config.timeout_for("summarize", Some(30)), 30);
        assert_eq!(config.timeout_for("chat", Some(0)), 600);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let config = DispatcherConfig {
            strategy: "random".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let config = RetryConfig {
            base_delay_ms: 5000,
            max_delay_ms: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RetryConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
