use serde::{Deserialize, Serialize};

/// 随部署安装的束流读取脚本 (scripts/read_beam_current.py)
pub const DEFAULT_BEAM_PROBE_SCRIPT: &str = "/opt/autoreduce/read_beam_current.py";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 同一实验被占用时重新检查的间隔
    pub hold_interval_seconds: u64,
    pub max_concurrent_runs: usize,
    pub status_publish_retries: u32,
    pub beam_current_threshold: f64,
    /// 读取束流值的辅助命令, 数据文件路径追加在末尾
    pub beam_probe_command: Vec<String>,
    pub shutdown_drain_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            hold_interval_seconds: 10,
            max_concurrent_runs: 4,
            status_publish_retries: 3,
            beam_current_threshold: 0.1,
            beam_probe_command: vec![
                "python3".to_string(),
                DEFAULT_BEAM_PROBE_SCRIPT.to_string(),
            ],
            shutdown_drain_seconds: 30,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hold_interval_seconds == 0 {
            return Err(anyhow::anyhow!("等待间隔必须大于0"));
        }

        if self.max_concurrent_runs == 0 {
            return Err(anyhow::anyhow!("最大并发运行数必须大于0"));
        }

        if !self.beam_current_threshold.is_finite() || self.beam_current_threshold < 0.0 {
            return Err(anyhow::anyhow!(
                "束流阈值无效: {}",
                self.beam_current_threshold
            ));
        }

        if self.beam_probe_command.first().map_or(true, |p| p.is_empty()) {
            return Err(anyhow::anyhow!("束流探测命令不能为空"));
        }

        Ok(())
    }
}

/// 自动重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub delay_seconds: u64,
    pub max_run_version: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_seconds: 6 * 60 * 60,
            max_run_version: 4,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.delay_seconds == 0 {
            return Err(anyhow::anyhow!("重试延迟必须大于0"));
        }
        Ok(())
    }
}
