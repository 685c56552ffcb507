use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoreduce_core::{
    config::DispatcherConfig, AutoreduceError, JobMessage, PathTranslator, Result,
};
use tokio::process::Command;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// 读取数据文件中的束流记录, 返回平均值
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BeamCurrentProbe: Send + Sync {
    async fn mean_beam_current(&self, data_file: &Path) -> Result<f64>;
}

/// 通过外部辅助命令读取束流值
///
/// 命令以数据文件路径为最后一个参数, 在标准输出打印
/// `raw_data_1/runlog/dae_beam_current/value` 的所有采样值 (空白分隔)。
pub struct CommandBeamCurrentProbe {
    argv: Vec<String>,
}

impl CommandBeamCurrentProbe {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl BeamCurrentProbe for CommandBeamCurrentProbe {
    async fn mean_beam_current(&self, data_file: &Path) -> Result<f64> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| AutoreduceError::Configuration("束流探测命令为空".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(data_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| AutoreduceError::Path(format!("读取束流超时: {}", data_file.display())))?
            .map_err(|e| AutoreduceError::Path(format!("无法启动束流探测命令: {e}")))?;

        if !output.status.success() {
            return Err(AutoreduceError::Path(format!(
                "束流探测命令失败 ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        mean_of_samples(&String::from_utf8_lossy(&output.stdout))
    }
}

fn mean_of_samples(text: &str) -> Result<f64> {
    let samples = text
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| AutoreduceError::Serialization(format!("无效的束流值: {v}")))
        })
        .collect::<Result<Vec<f64>>>()?;

    if let Some(bad) = samples.iter().find(|v| !v.is_finite()) {
        return Err(AutoreduceError::Serialization(format!("无效的束流值: {bad}")));
    }
    if samples.is_empty() {
        return Err(AutoreduceError::Serialization("束流记录为空".to_string()));
    }
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// 作业准入校验
pub struct JobValidator {
    translator: PathTranslator,
    beam_current_threshold: f64,
    probe: Option<Arc<dyn BeamCurrentProbe>>,
}

impl JobValidator {
    pub fn new(
        translator: PathTranslator,
        beam_current_threshold: f64,
        probe: Option<Arc<dyn BeamCurrentProbe>>,
    ) -> Self {
        Self {
            translator,
            beam_current_threshold,
            probe,
        }
    }

    pub fn from_config(config: &DispatcherConfig, translator: PathTranslator) -> Self {
        let probe: Arc<dyn BeamCurrentProbe> = Arc::new(CommandBeamCurrentProbe::new(
            config.beam_probe_command.clone(),
        ));
        Self::new(translator, config.beam_current_threshold, Some(probe))
    }

    /// 返回 None 表示作业可以执行; 否则返回全部不通过原因, 以 " & " 连接
    pub async fn validate(&self, job: &JobMessage) -> Option<String> {
        let mut reasons = Vec::new();

        match job.experiment_id.as_integer() {
            None => reasons.push("Calibration file detected (RB Number is a string)".to_string()),
            Some(n) if n <= 0 => reasons.push(
                "Calibration file detected (RB Number less than or equal to 0)".to_string(),
            ),
            Some(_) => {}
        }

        if let Some(probe) = &self.probe {
            let data_file = PathBuf::from(self.translator.translate(&job.data_path));
            match probe.mean_beam_current(&data_file).await {
                Ok(mean) if mean < self.beam_current_threshold => reasons.push(format!(
                    "Assuming data is invalid due to beam current value of {mean}"
                )),
                Ok(mean) => debug!("{} 束流均值 {}", job.identity(), mean),
                Err(e) => {
                    warn!("读取束流失败: {}: {}", data_file.display(), e);
                    reasons.push(format!(
                        "Unable to read data file at location: {}",
                        data_file.display()
                    ));
                }
            }
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join(" & "))
        }
    }
}
