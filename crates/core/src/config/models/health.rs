use serde::{Deserialize, Serialize};

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 探测间隔
    pub probe_interval_ms: u64,
    /// 单次探测超时
    pub probe_timeout_ms: u64,
    /// 连续失败达到该次数时 ACTIVE → SUSPECT
    pub suspect_threshold: u32,
    /// 连续失败达到该次数时判定为 DEAD
    pub dead_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5000,
            probe_timeout_ms: 2000,
            suspect_threshold: 1,
            dead_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.probe_interval_ms == 0 {
            return Err(anyhow::anyhow!("探测间隔必须大于0"));
        }

        if self.probe_timeout_ms == 0 {
            return Err(anyhow::anyhow!("探测超时时间必须大于0"));
        }

        if self.probe_timeout_ms > self.probe_interval_ms {
            return Err(anyhow::anyhow!("探测超时时间不能大于探测间隔"));
        }

        if self.suspect_threshold == 0 {
            return Err(anyhow::anyhow!("可疑阈值必须大于0"));
        }

        if self.dead_threshold <= self.suspect_threshold {
            return Err(anyhow::anyhow!("死亡阈值必须大于可疑阈值"));
        }

        Ok(())
    }
}
