use thiserror::Error;

use crate::models::RunIdentity;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum AutoreduceError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("消息代理错误: {0}")]
    Broker(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("路径错误: {0}")]
    Path(String),

    #[error("运行记录未找到: {identity}")]
    RunNotFound { identity: RunIdentity },

    #[error("运行记录已存在: {identity}")]
    DuplicateRun { identity: RunIdentity },

    #[error("拒绝创建重试: {0}")]
    RetryRejected(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AutoreduceError {
    fn from(e: serde_json::Error) -> Self {
        AutoreduceError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, AutoreduceError>;
