use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use autoreduce_core::{
    config::{AppConfig, BrokerConfig, DispatcherConfig},
    AckMode, AutoreduceError, BrokerClient, Delivery, JobMessage, Outcome, ReductionExecutor,
    Result, RunIdentity, RunRecord, RunStateStore, RunStatus, StatusMessage,
};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::admission::{AdmissionSlot, CancelSet, DedupRegistry};
use crate::retry_service::RetryService;
use crate::validator::JobValidator;
use crate::CANCELLED_MESSAGE;

/// 作业的来源: 代理投递或等待后的重新检查
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Broker,
    Recheck,
}

/// 约简作业调度器
///
/// 单一控制循环负责消息接收和状态转换; 每个准入的运行在独立任务中执行,
/// 因此长时间运行的脚本不会阻塞其他实验的消息处理。
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn RunStateStore>,
    executor: Arc<dyn ReductionExecutor>,
    validator: JobValidator,
    retries: RetryService,
    dedup: Arc<DedupRegistry>,
    cancels: CancelSet,
    queues: BrokerConfig,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn RunStateStore>,
        executor: Arc<dyn ReductionExecutor>,
        validator: JobValidator,
    ) -> Self {
        let retries = RetryService::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            config.broker.pending_queue.clone(),
            config.retry.clone(),
        );

        Self {
            shared: Arc::new(Shared {
                broker,
                store,
                executor,
                validator,
                retries,
                dedup: Arc::new(DedupRegistry::new()),
                cancels: CancelSet::new(),
                queues: config.broker.clone(),
                config: config.dispatcher.clone(),
                permits: Arc::new(Semaphore::new(config.dispatcher.max_concurrent_runs)),
            }),
        }
    }

    pub fn dedup(&self) -> &DedupRegistry {
        &self.shared.dedup
    }

    pub fn retry_service(&self) -> &RetryService {
        &self.shared.retries
    }

    /// 消费待处理队列直到收到关闭信号
    ///
    /// 代理连接不可恢复时返回 `Err`; 单个运行的失败不会终止循环。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let shared = &self.shared;
        shared.broker.connect().await?;
        let mut deliveries = shared
            .broker
            .subscribe(&shared.queues.pending_queue, AckMode::Client)
            .await?;
        info!("开始消费队列: {}", shared.queues.pending_queue);

        let (recheck_tx, mut recheck_rx) = mpsc::unbounded_channel();
        let mut event_loop = EventLoop {
            shared: Arc::clone(shared),
            held: HashSet::new(),
            tasks: JoinSet::new(),
            recheck_tx,
        };

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号, 停止接收新作业");
                    break Ok(());
                }
                delivery = deliveries.recv() => match delivery {
                    Some(Ok(delivery)) => event_loop.handle_delivery(delivery).await,
                    Some(Err(e)) => {
                        error!("消息代理连接不可恢复, 停止消费: {}", e);
                        break Err(e);
                    }
                    None => {
                        error!("投递流意外关闭");
                        break Err(AutoreduceError::Broker("投递流已关闭".to_string()));
                    }
                },
                Some(job) = recheck_rx.recv() => {
                    event_loop.handle_job(job, Source::Recheck).await;
                }
                Some(joined) = event_loop.tasks.join_next(), if !event_loop.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("运行任务异常退出: {}", e);
                        }
                    }
                }
            }
        };

        event_loop.drain().await;
        shared.retries.abort_all();
        result
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    /// 等待实验槽位的运行
    held: HashSet<RunIdentity>,
    tasks: JoinSet<()>,
    recheck_tx: mpsc::UnboundedSender<JobMessage>,
}

impl EventLoop {
    async fn handle_delivery(&mut self, delivery: Delivery) {
        // 先确认, 重复投递由幂等处理兜底
        if let Err(e) = self.shared.broker.ack(&delivery).await {
            warn!("确认消息 {} 失败: {}", delivery.delivery_tag, e);
        }

        let job = match JobMessage::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    "无法解析队列 {} 的消息 {}: {}",
                    delivery.queue, delivery.delivery_tag, e
                );
                return;
            }
        };

        if delivery.redelivered {
            debug!("重复投递的作业: {}", job.identity());
        }

        if job.cancel {
            self.handle_cancel(&job).await;
        } else {
            self.handle_job(job, Source::Broker).await;
        }
    }

    #[instrument(skip(self, job), fields(run = %job.identity()))]
    async fn handle_cancel(&mut self, job: &JobMessage) {
        let shared = &self.shared;
        let identity = job.identity();

        let record = match shared.store.find_run(&identity).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("{} 尚未收到, 记录取消请求", identity);
                shared.cancels.insert(identity);
                return;
            }
            Err(e) => {
                error!("查询运行记录失败, 取消请求未生效: {}", e);
                return;
            }
        };

        if let Err(e) = shared.store.mark_cancelled(&identity).await {
            error!("标记取消失败: {}", e);
            return;
        }

        match record.status {
            RunStatus::Queued => {
                if let Some(original) = &record.retry_of {
                    shared.retries.abort_scheduled(original);
                    if let Err(e) = shared.store.clear_retry(original).await {
                        warn!("清除 {} 的重试失败: {}", original, e);
                    }
                }
                shared.resolve_cancelled(&identity).await;
            }
            RunStatus::Processing => {
                info!("{} 正在运行, 结束后标记为取消", identity);
            }
            RunStatus::Error if record.has_pending_retry() => {
                match shared.retries.cancel_pending(&identity).await {
                    Ok(Some(retry)) => {
                        shared
                            .publish(
                                &shared.queues.error_queue,
                                &StatusMessage::from_record(&retry),
                            )
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("取消重试失败: {}", e),
                }
            }
            status => info!("{} 已处于终态 {}, 仅记录取消", identity, status),
        }
    }

    #[instrument(skip(self, job, source), fields(run = %job.identity(), source = ?source))]
    async fn handle_job(&mut self, job: JobMessage, source: Source) {
        let shared = Arc::clone(&self.shared);
        let identity = job.identity();

        match source {
            Source::Broker if self.held.contains(&identity) => {
                debug!("{} 已在等待中, 忽略重复投递", identity);
                return;
            }
            Source::Recheck => {
                self.held.remove(&identity);
            }
            Source::Broker => {}
        }

        let existing = match shared.store.find_run(&identity).await {
            Ok(existing) => existing,
            Err(e) => {
                error!("查询运行记录失败, 稍后重试: {}", e);
                self.hold(job);
                return;
            }
        };

        match existing {
            Some(record) if record.status.is_terminal() => {
                if source == Source::Broker {
                    info!("{} 已结束 ({}), 重新发布最终状态", identity, record.status);
                    shared.publish_terminal(&record).await;
                }
                return;
            }
            Some(record) if record.status == RunStatus::Processing => {
                debug!("{} 正在处理中, 忽略重复投递", identity);
                return;
            }
            Some(record)
                if shared.dedup.holder(&record.experiment_id).as_ref() == Some(&identity) =>
            {
                debug!("{} 已获准入, 忽略重复投递", identity);
                return;
            }
            Some(record) if record.cancelled => {
                shared.resolve_cancelled(&identity).await;
                return;
            }
            Some(_) => {}
            None => match shared.store.create_run(&job).await {
                Ok(_) | Err(AutoreduceError::DuplicateRun { .. }) => {}
                Err(e) => {
                    error!("创建运行记录失败, 稍后重试: {}", e);
                    self.hold(job);
                    return;
                }
            },
        }

        if shared.cancels.consume_if_cancelled(&identity) {
            info!("{} 在到达前已被取消", identity);
            if let Err(e) = shared.store.mark_cancelled(&identity).await {
                warn!("标记取消失败: {}", e);
            }
            shared.resolve_cancelled(&identity).await;
            return;
        }

        match shared.dedup.try_claim(&identity) {
            Some(slot) => {
                self.tasks.spawn(process_run(shared, job, slot));
            }
            None => self.hold(job),
        }
    }

    /// 非阻塞等待: 间隔到期后把作业送回控制循环
    fn hold(&mut self, job: JobMessage) {
        self.held.insert(job.identity());
        let interval = Duration::from_secs(self.shared.config.hold_interval_seconds);
        let tx = self.recheck_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(job);
        });
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        let grace = Duration::from_secs(self.shared.config.shutdown_drain_seconds);
        info!("等待 {} 个运行结束 (最长 {} 秒)", self.tasks.len(), grace.as_secs());
        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("仍有 {} 个运行未结束, 强制终止", self.tasks.len());
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

impl Shared {
    /// Queued 运行因取消而结束
    async fn resolve_cancelled(&self, identity: &RunIdentity) {
        if let Err(e) = self
            .store
            .update_status(identity, RunStatus::Error, Some(CANCELLED_MESSAGE.to_string()))
            .await
        {
            // 已经开始执行, 由运行任务在结束时处理
            debug!("{} 无法直接结束: {}", identity, e);
            return;
        }
        info!("{} 已取消", identity);
        self.publish_current(identity).await;
    }

    async fn publish_current(&self, identity: &RunIdentity) {
        match self.store.find_run(identity).await {
            Ok(Some(record)) => self.publish_terminal(&record).await,
            Ok(None) => warn!("{} 的运行记录不存在, 无法发布状态", identity),
            Err(e) => error!("读取 {} 的运行记录失败: {}", identity, e),
        }
    }

    async fn publish_terminal(&self, record: &RunRecord) {
        let queue = match record.status {
            RunStatus::Completed => &self.queues.complete_queue,
            _ => &self.queues.error_queue,
        };
        self.publish(queue, &StatusMessage::from_record(record)).await;
    }

    /// 发布状态消息, 失败时按 100ms * 2^n 退避重试
    async fn publish(&self, queue: &str, message: &StatusMessage) {
        let payload = match message.to_vec() {
            Ok(payload) => payload,
            Err(e) => {
                error!("序列化状态消息失败: {}", e);
                return;
            }
        };

        let max_retries = self.config.status_publish_retries;
        let mut retry = 0;
        loop {
            match self.broker.send(queue, &payload, 0).await {
                Ok(()) => {
                    debug!(
                        "已发布 RB{} run {} v{} 的 {} 状态到 {}",
                        message.experiment_id,
                        message.run_number,
                        message.run_version,
                        message.status,
                        queue
                    );
                    return;
                }
                Err(e) if retry < max_retries => {
                    retry += 1;
                    warn!("发布状态消息失败 (第{}次重试): {}", retry, e);
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retry))).await;
                }
                Err(e) => {
                    error!(
                        "发布 RB{} run {} v{} 的状态到 {} 失败: {}",
                        message.experiment_id, message.run_number, message.run_version, queue, e
                    );
                    return;
                }
            }
        }
    }
}

/// 已获准入的运行: 校验, 执行, 记录并发布结果; 槽位在结束时释放
async fn process_run(shared: Arc<Shared>, job: JobMessage, slot: AdmissionSlot) {
    let _slot = slot;
    let identity = job.identity();

    let _permit = match Arc::clone(&shared.permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            error!("{} 无法获取执行许可: {}", identity, e);
            return;
        }
    };

    if let Some(reason) = shared.validator.validate(&job).await {
        info!("{} 未通过校验: {}", identity, reason);
        match shared
            .store
            .update_status(&identity, RunStatus::Skipped, Some(reason))
            .await
        {
            Ok(()) => shared.publish_current(&identity).await,
            Err(e) => warn!("{} 无法标记为跳过: {}", identity, e),
        }
        return;
    }

    if let Err(e) = shared
        .store
        .update_status(&identity, RunStatus::Processing, None)
        .await
    {
        // 等待期间已被取消
        info!("{} 不再执行: {}", identity, e);
        return;
    }
    shared
        .publish(
            &shared.queues.started_queue,
            &StatusMessage::for_job(&job, RunStatus::Processing),
        )
        .await;

    let outcome = shared.executor.execute(&job).await;

    let cancelled = match shared.store.find_run(&identity).await {
        Ok(record) => record.is_some_and(|r| r.cancelled),
        Err(e) => {
            warn!("{} 无法读取取消标记: {}", identity, e);
            false
        }
    };

    let (status, message) = if cancelled {
        info!("{} 执行期间被取消", identity);
        (RunStatus::Error, Some(CANCELLED_MESSAGE.to_string()))
    } else {
        match &outcome {
            Outcome::Completed { .. } => (RunStatus::Completed, None),
            Outcome::Error { kind, message, .. } => (kind.terminal_status(), Some(message.clone())),
        }
    };

    let output_directory = outcome
        .output_directory()
        .map(|dir| dir.display().to_string());
    if let Err(e) = shared
        .store
        .record_output(&identity, outcome.logs().cloned(), output_directory)
        .await
    {
        error!("{} 记录输出位置失败: {}", identity, e);
    }
    if let Err(e) = shared.store.update_status(&identity, status, message).await {
        error!("{} 更新最终状态失败: {}", identity, e);
    }

    let record = match shared.store.find_run(&identity).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            error!("{} 的运行记录丢失", identity);
            return;
        }
        Err(e) => {
            error!("读取 {} 的运行记录失败: {}", identity, e);
            return;
        }
    };
    info!("{} 结束: {}", identity, record.status);
    shared.publish_terminal(&record).await;

    if let Outcome::Error { kind, .. } = outcome {
        if !cancelled {
            match shared.retries.auto_retry(&record, kind).await {
                Ok(Some(retry)) => info!("{} 将以 {} 重试", identity, retry.identity),
                Ok(None) => {}
                Err(e) => warn!("{} 创建自动重试失败: {}", identity, e),
            }
        }
    }
}
