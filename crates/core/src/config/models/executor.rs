use serde::{Deserialize, Serialize};

/// Reduction script execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interpreter argv; script, data, staging and variables paths are appended
    pub interpreter: Vec<String>,
    pub script_timeout_seconds: u64,
    /// Exit status a script uses to report an unsupported run
    pub skip_exit_code: i32,
    pub log_excerpt_bytes: usize,
    pub kill_grace_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            script_timeout_seconds: 3600,
            skip_exit_code: 3,
            log_excerpt_bytes: 64 * 1024,
            kill_grace_seconds: 2,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interpreter.first().map_or(true, |p| p.is_empty()) {
            return Err(anyhow::anyhow!("解释器命令不能为空"));
        }

        if self.script_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("脚本超时时间必须大于0"));
        }

        if self.skip_exit_code == 0 {
            return Err(anyhow::anyhow!("跳过退出码不能为0"));
        }

        Ok(())
    }
}
