use std::path::PathBuf;

use super::{LogLocations, RunStatus};

/// 执行失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 路径缺失或不可访问, 脚本尚未运行
    Path,
    Script,
    Timeout,
    /// 脚本声明不支持该运行
    Unsupported,
    Cancelled,
}

impl FailureKind {
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            FailureKind::Unsupported => RunStatus::Skipped,
            _ => RunStatus::Error,
        }
    }

    /// 可以自动重试的失败
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Script | FailureKind::Timeout)
    }
}

/// Executor 的执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        logs: LogLocations,
        output_directory: PathBuf,
    },
    Error {
        kind: FailureKind,
        message: String,
        logs: Option<LogLocations>,
        output_directory: Option<PathBuf>,
    },
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Error {
            kind,
            message: message.into(),
            logs: None,
            output_directory: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Outcome::Completed { .. } => RunStatus::Completed,
            Outcome::Error { kind, .. } => kind.terminal_status(),
        }
    }

    pub fn logs(&self) -> Option<&LogLocations> {
        match self {
            Outcome::Completed { logs, .. } => Some(logs),
            Outcome::Error { logs, .. } => logs.as_ref(),
        }
    }

    pub fn output_directory(&self) -> Option<&PathBuf> {
        match self {
            Outcome::Completed {
                output_directory, ..
            } => Some(output_directory),
            Outcome::Error {
                output_directory, ..
            } => output_directory.as_ref(),
        }
    }
}
