use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use autoreduce_core::{
    config::RetryConfig, models::VariableMap, AutoreduceError, BrokerClient, FailureKind,
    Result, RunIdentity, RunRecord, RunStateStore, RunStatus,
};
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::CANCELLED_MESSAGE;

/// 并发创建重试时版本号冲突的最大重试次数
const MAX_VERSION_ATTEMPTS: usize = 5;

/// 重试时可覆盖的作业内容; 未设置的字段沿用原运行
#[derive(Debug, Clone, Default)]
pub struct RetryOverrides {
    pub script_text: Option<String>,
    pub standard_vars: Option<VariableMap>,
    pub advanced_vars: Option<VariableMap>,
}

/// 重试服务
///
/// 为失败的运行分配新版本的记录, 并在 `retry_at` 到达时
/// 把重试作业重新发布到待处理队列。
pub struct RetryService {
    store: Arc<dyn RunStateStore>,
    broker: Arc<dyn BrokerClient>,
    pending_queue: String,
    policy: RetryConfig,
    /// 原运行 -> 定时发布任务
    scheduled: Mutex<HashMap<RunIdentity, JoinHandle<()>>>,
}

impl RetryService {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        broker: Arc<dyn BrokerClient>,
        pending_queue: impl Into<String>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            store,
            broker,
            pending_queue: pending_queue.into(),
            policy,
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    fn scheduled(&self) -> MutexGuard<'_, HashMap<RunIdentity, JoinHandle<()>>> {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 创建重试记录: 版本号为该 (实验, 运行号) 已有最大版本 + 1
    #[instrument(skip(self, run, overrides), fields(run = %run.identity))]
    pub async fn create_retry(
        &self,
        run: &RunRecord,
        delay: Duration,
        overrides: RetryOverrides,
    ) -> Result<RunRecord> {
        if run.cancelled {
            return Err(AutoreduceError::RetryRejected(format!(
                "{} 已被取消",
                run.identity
            )));
        }

        let mut job = run.job.clone();
        if let Some(script_text) = overrides.script_text {
            job.script_text = script_text;
        }
        if let Some(standard_vars) = overrides.standard_vars {
            job.standard_vars = standard_vars;
        }
        if let Some(advanced_vars) = overrides.advanced_vars {
            job.advanced_vars = advanced_vars;
        }

        let mut attempt = 0;
        let created = loop {
            let max_version = self
                .store
                .find_max_version(&run.identity.experiment, run.identity.run_number)
                .await?
                .map_or(run.identity.run_version, |v| v.max(run.identity.run_version));
            let retry_job = job.with_version(max_version + 1);

            match self.store.create_run(&retry_job).await {
                Ok(record) => break record,
                Err(AutoreduceError::DuplicateRun { identity })
                    if attempt + 1 < MAX_VERSION_ATTEMPTS =>
                {
                    attempt += 1;
                    debug!("版本冲突 {}, 重新分配版本号 (第{}次)", identity, attempt);
                }
                Err(e) => return Err(e),
            }
        };

        let retry_at = Utc::now() + delay;
        self.store
            .link_retry(&run.identity, &created.identity, retry_at)
            .await?;

        info!(
            "为 {} 创建重试 {}, 计划时间: {}",
            run.identity,
            created.identity,
            retry_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Ok(self
            .store
            .find_run(&created.identity)
            .await?
            .unwrap_or(created))
    }

    /// 到达 `retry_at` 时发布重试作业
    pub fn schedule_publish(&self, original: &RunIdentity, retry: &RunRecord) {
        let retry_at = retry.retry_at.unwrap_or_else(Utc::now);
        let job = retry.job.clone();
        let broker = Arc::clone(&self.broker);
        let queue = self.pending_queue.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(until(retry_at)).await;
            let payload = match job.to_vec() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("序列化重试作业 {} 失败: {}", job.identity(), e);
                    return;
                }
            };
            match broker.send(&queue, &payload, 0).await {
                Ok(()) => info!("已发布重试作业 {}", job.identity()),
                Err(e) => error!("发布重试作业 {} 失败: {}", job.identity(), e),
            }
        });

        let mut scheduled = self.scheduled();
        scheduled.retain(|_, h| !h.is_finished());
        if let Some(previous) = scheduled.insert(original.clone(), handle) {
            previous.abort();
        }
    }

    /// 取消原运行尚未发布的重试, 返回被取消的重试记录
    #[instrument(skip(self))]
    pub async fn cancel_pending(&self, original: &RunIdentity) -> Result<Option<RunRecord>> {
        if let Some(handle) = self.scheduled().remove(original) {
            handle.abort();
        }

        let Some(record) = self.store.find_run(original).await? else {
            return Err(AutoreduceError::RunNotFound {
                identity: original.clone(),
            });
        };
        self.store.clear_retry(original).await?;

        let Some(retry_identity) = &record.retry_run else {
            return Ok(None);
        };
        let Some(retry) = self.store.find_run(retry_identity).await? else {
            return Ok(None);
        };

        self.store.mark_cancelled(retry_identity).await?;
        if retry.status == RunStatus::Queued {
            self.store
                .update_status(
                    retry_identity,
                    RunStatus::Error,
                    Some(CANCELLED_MESSAGE.to_string()),
                )
                .await?;
        }
        info!("已取消 {} 的重试 {}", original, retry_identity);
        self.store.find_run(retry_identity).await
    }

    /// 中止等待中的重试发布, 重试记录保留 Queued
    pub fn abort_scheduled(&self, original: &RunIdentity) -> bool {
        match self.scheduled().remove(original) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        for (_, handle) in self.scheduled().drain() {
            handle.abort();
        }
    }

    /// 失败运行是否应自动重试
    pub fn should_auto_retry(&self, record: &RunRecord, kind: FailureKind) -> bool {
        self.policy.enabled
            && kind.is_retryable()
            && !record.cancelled
            && record.identity.run_version < self.policy.max_run_version
    }

    /// 按策略创建并安排自动重试
    pub async fn auto_retry(
        &self,
        record: &RunRecord,
        kind: FailureKind,
    ) -> Result<Option<RunRecord>> {
        if !self.should_auto_retry(record, kind) {
            return Ok(None);
        }

        let delay = Duration::seconds(self.policy.delay_seconds.min(i32::MAX as u64) as i64);
        let retry = self
            .create_retry(record, delay, RetryOverrides::default())
            .await?;
        self.schedule_publish(&record.identity, &retry);
        Ok(Some(retry))
    }
}

impl Drop for RetryService {
    fn drop(&mut self) {
        let pending = self
            .scheduled()
            .values()
            .filter(|h| !h.is_finished())
            .count();
        if pending > 0 {
            warn!("放弃 {} 个尚未发布的重试", pending);
        }
        self.abort_all();
    }
}

fn until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or_default()
}
