use serde::{Deserialize, Serialize};

/// 性能系数计算参数
///
/// `factor = success^w_s · (baseline_exec / ewma_exec)^w_e · (ewma_tps / baseline_tps)^w_t`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// EWMA 平滑系数，越大越偏向最近的观测
    pub alpha: f64,
    pub baseline_exec_ms: f64,
    pub baseline_tokens_per_second: f64,
    pub success_weight: f64,
    pub exec_time_weight: f64,
    pub throughput_weight: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// 启动时从历史指标预热的时间窗口，0 表示不预热
    pub warmup_window_hours: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            baseline_exec_ms: 30_000.0,
            baseline_tokens_per_second: 50.0,
            success_weight: 2.0,
            exec_time_weight: 0.5,
            throughput_weight: 0.5,
            min_factor: 0.05,
            max_factor: 5.0,
            warmup_window_hours: 24,
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(anyhow::anyhow!("EWMA平滑系数必须在(0, 1]之间"));
        }

        if !(self.baseline_exec_ms > 0.0) || !(self.baseline_tokens_per_second > 0.0) {
            return Err(anyhow::anyhow!("性能基准值必须大于0"));
        }

        let weights = [
            self.success_weight,
            self.exec_time_weight,
            self.throughput_weight,
        ];
        if weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(anyhow::anyhow!("性能权重不能为负数"));
        }

        if !(self.min_factor >= 0.0) || !(self.max_factor >= self.min_factor) {
            return Err(anyhow::anyhow!("性能系数上下限无效"));
        }

        Ok(())
    }
}
