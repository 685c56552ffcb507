use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ExperimentId, JobMessage, LogLocations, RunIdentity, RunRecord, RunStatus};
use crate::Result;

/// 运行记录存储; 外部记录系统的窄接口
///
/// 记录以 `RunIdentity` (实验, 运行号, 版本号) 为键。
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// 以 Queued 状态创建记录; 标识已存在时返回 `DuplicateRun`
    async fn create_run(&self, job: &JobMessage) -> Result<RunRecord>;

    async fn find_run(&self, identity: &RunIdentity) -> Result<Option<RunRecord>>;

    async fn update_status(
        &self,
        identity: &RunIdentity,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<()>;

    async fn record_output(
        &self,
        identity: &RunIdentity,
        logs: Option<LogLocations>,
        output_directory: Option<String>,
    ) -> Result<()>;

    /// 该实验下某运行号已有的最大版本
    async fn find_max_version(
        &self,
        experiment_id: &ExperimentId,
        run_number: u64,
    ) -> Result<Option<u32>>;

    /// 原记录指向重试记录, 重试记录的 `retry_of` 指回原记录, 两者都记录 `retry_at`
    async fn link_retry(
        &self,
        identity: &RunIdentity,
        retry_identity: &RunIdentity,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn clear_retry(&self, identity: &RunIdentity) -> Result<()>;

    async fn mark_cancelled(&self, identity: &RunIdentity) -> Result<()>;
}
