use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExperimentId, JobMessage};
use crate::AutoreduceError;

/// 一次运行尝试的标识: (实验, 运行号, 版本号)
///
/// 运行号只在同一实验内唯一; 实验编号以规范形式保存。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunIdentity {
    pub experiment: ExperimentId,
    pub run_number: u64,
    pub run_version: u32,
}

impl RunIdentity {
    pub fn new(experiment: impl Into<ExperimentId>, run_number: u64, run_version: u32) -> Self {
        Self {
            experiment: experiment.into().normalized(),
            run_number,
            run_version,
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RB{} run {} v{}",
            self.experiment, self.run_number, self.run_version
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Error => "ERROR",
            RunStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Skipped
        )
    }

    /// Queued -> Processing -> 终态; Queued 也可以直接进入终态 (取消, 校验失败)
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Queued, RunStatus::Processing) => true,
            (RunStatus::Queued, s) | (RunStatus::Processing, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AutoreduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "PROCESSING" => Ok(RunStatus::Processing),
            "COMPLETED" => Ok(RunStatus::Completed),
            "ERROR" => Ok(RunStatus::Error),
            "SKIPPED" => Ok(RunStatus::Skipped),
            _ => Err(AutoreduceError::Serialization(format!(
                "无效的运行状态: {s}"
            ))),
        }
    }
}

/// 脚本输出日志文件位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLocations {
    pub out_log: PathBuf,
    pub err_log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub identity: RunIdentity,
    pub experiment_id: ExperimentId,
    pub instrument: String,
    pub status: RunStatus,
    pub retry_of: Option<RunIdentity>,
    pub retry_run: Option<RunIdentity>,
    pub retry_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub message: Option<String>,
    pub log_locations: Option<LogLocations>,
    pub output_directory: Option<String>,
    /// 接收时的作业, 重试时复用其脚本与变量
    pub job: JobMessage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// 接收作业时创建的初始记录
    pub fn queued(job: &JobMessage) -> Self {
        let now = Utc::now();
        Self {
            identity: job.identity(),
            experiment_id: job.experiment_id.clone(),
            instrument: job.instrument.clone(),
            status: RunStatus::Queued,
            retry_of: None,
            retry_run: None,
            retry_at: None,
            cancelled: false,
            message: None,
            log_locations: None,
            output_directory: None,
            job: job.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 状态为 Error 且安排了重试
    pub fn has_pending_retry(&self) -> bool {
        self.retry_at.is_some() && self.retry_run.is_some()
    }
}
