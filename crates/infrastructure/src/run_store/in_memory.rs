use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use autoreduce_core::{
    models::{ExperimentId, JobMessage, LogLocations, RunIdentity, RunRecord, RunStatus},
    traits::RunStateStore,
    AutoreduceError, Result,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存运行记录存储
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<RunIdentity, RunRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按标识排序的全部记录
    pub async fn all_runs(&self) -> Vec<RunRecord> {
        let runs = self.runs.read().await;
        let mut records: Vec<_> = runs.values().cloned().collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// 直接写入记录, 用于准备测试数据
    pub async fn insert(&self, record: RunRecord) {
        self.runs.write().await.insert(record.identity.clone(), record);
    }
}

fn not_found(identity: &RunIdentity) -> AutoreduceError {
    AutoreduceError::RunNotFound {
        identity: identity.clone(),
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStore {
    async fn create_run(&self, job: &JobMessage) -> Result<RunRecord> {
        let mut runs = self.runs.write().await;
        let identity = job.identity();
        if runs.contains_key(&identity) {
            return Err(AutoreduceError::DuplicateRun { identity });
        }

        let record = RunRecord::queued(job);
        debug!("创建运行记录: {}", identity);
        runs.insert(identity, record.clone());
        Ok(record)
    }

    async fn find_run(&self, identity: &RunIdentity) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(identity).cloned())
    }

    async fn update_status(
        &self,
        identity: &RunIdentity,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(identity).ok_or_else(|| not_found(identity))?;

        if !record.status.can_transition_to(status) {
            return Err(AutoreduceError::Internal(format!(
                "{} 无法从 {} 转换到 {}",
                identity, record.status, status
            )));
        }

        record.status = status;
        if message.is_some() {
            record.message = message;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_output(
        &self,
        identity: &RunIdentity,
        logs: Option<LogLocations>,
        output_directory: Option<String>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(identity).ok_or_else(|| not_found(identity))?;
        record.log_locations = logs;
        record.output_directory = output_directory;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn find_max_version(
        &self,
        experiment_id: &ExperimentId,
        run_number: u64,
    ) -> Result<Option<u32>> {
        let experiment = experiment_id.normalized();
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.identity.experiment == experiment && r.identity.run_number == run_number)
            .map(|r| r.identity.run_version)
            .max())
    }

    async fn link_retry(
        &self,
        identity: &RunIdentity,
        retry_identity: &RunIdentity,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(retry_identity) {
            return Err(not_found(retry_identity));
        }

        let original = runs.get_mut(identity).ok_or_else(|| not_found(identity))?;
        original.retry_run = Some(retry_identity.clone());
        original.retry_at = Some(retry_at);
        original.updated_at = Utc::now();

        if let Some(retry) = runs.get_mut(retry_identity) {
            retry.retry_of = Some(identity.clone());
            retry.retry_at = Some(retry_at);
        }
        Ok(())
    }

    async fn clear_retry(&self, identity: &RunIdentity) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(identity).ok_or_else(|| not_found(identity))?;
        record.retry_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_cancelled(&self, identity: &RunIdentity) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(identity).ok_or_else(|| not_found(identity))?;
        record.cancelled = true;
        record.updated_at = Utc::now();
        Ok(())
    }
}
