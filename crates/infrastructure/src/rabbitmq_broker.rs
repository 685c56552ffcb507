use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoreduce_core::{
    config::BrokerConfig,
    traits::{AckMode, BrokerClient, Delivery, DeliveryReceiver},
    AutoreduceError, Result,
};
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

const DELIVERY_BUFFER: usize = 256;

/// RabbitMQ消息代理客户端
///
/// 发送、确认和消费者共用一个会话 (连接加通道), 会话由互斥锁保护。
/// 检查会话与重连在同一次加锁内完成, 并发调用方等待同一次重连。
/// 每次重连产生新的会话代次, 投递携带代次, 确认只在产生该投递的通道上进行。
/// 发送在锁外等待发布确认; 重连次数耗尽时向订阅者投递致命错误。
pub struct RabbitMqBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    session: Mutex<Option<Session>>,
    generations: AtomicU64,
    closed: AtomicBool,
}

struct Session {
    connection: Connection,
    channel: Channel,
    generation: u64,
}

impl Session {
    fn is_usable(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

impl RabbitMqBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session: Mutex::new(None),
                generations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    /// 返回当前会话的通道及其代次, 会话不可用时在持锁状态下重连
    async fn acquire(&self) -> Result<(Channel, u64)> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref().filter(|s| s.is_usable()) {
            return Ok((current.channel.clone(), current.generation));
        }

        let fresh = self.connect_with_backoff().await?;
        let handle = (fresh.channel.clone(), fresh.generation);
        if let Some(stale) = session.replace(fresh) {
            debug!("丢弃失效的RabbitMQ会话 #{}", stale.generation);
        }
        Ok(handle)
    }

    /// 通道操作失败后作废该代次的会话, 下次使用时重连
    async fn invalidate(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| s.generation == generation) {
            *session = None;
        }
    }

    async fn connect_with_backoff(&self) -> Result<Session> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.open_session().await {
                Ok(session) => {
                    info!(
                        "成功连接到RabbitMQ: {} (会话 #{})",
                        redact(&self.config.url),
                        session.generation
                    );
                    return Ok(session);
                }
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "连接RabbitMQ失败 (第{}/{}次): {}，{}ms后重试",
                        attempt + 1,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AutoreduceError::Broker("连接RabbitMQ失败".to_string())))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_delay_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }

    async fn open_session(&self) -> Result<Session> {
        let connect = Connection::connect(&self.config.url, ConnectionProperties::default());
        let connection = timeout(
            Duration::from_secs(self.config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| AutoreduceError::Broker("连接RabbitMQ超时".to_string()))?
        .map_err(|e| AutoreduceError::Broker(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AutoreduceError::Broker(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| AutoreduceError::Broker(format!("开启发布确认失败: {e}")))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| AutoreduceError::Broker(format!("设置预取数量失败: {e}")))?;

        for queue in self.config.all_queues() {
            self.declare_queue(&channel, queue).await?;
        }

        Ok(Session {
            connection,
            channel,
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn declare_queue(&self, channel: &Channel, queue_name: &str) -> Result<()> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(self.config.max_priority),
        );

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| AutoreduceError::Broker(format!("声明队列 {queue_name} 失败: {e}")))?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }

    async fn start_consumer(&self, queue: &str, ack_mode: AckMode) -> Result<(Consumer, u64)> {
        let (channel, generation) = self.acquire().await?;
        let consumer_tag = consumer_tag();

        let consumer = match channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.invalidate(generation).await;
                return Err(AutoreduceError::Broker(format!("创建消费者失败: {e}")));
            }
        };

        info!(
            "为队列 {} 创建消费者: {} (会话 #{})",
            queue, consumer_tag, generation
        );
        Ok((consumer, generation))
    }

    /// 消费者断开后恢复; 第一次失败会作废会话, 再尝试一次完整重连
    async fn restart_consumer(&self, queue: &str, ack_mode: AckMode) -> Result<(Consumer, u64)> {
        match self.start_consumer(queue, ack_mode).await {
            Ok(started) => Ok(started),
            Err(e) => {
                warn!("恢复队列 {} 的消费者失败: {}，重建会话", queue, e);
                self.start_consumer(queue, ack_mode).await
            }
        }
    }
}

fn consumer_tag() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("autoreduce-{}-{}", host, uuid::Uuid::new_v4().simple())
}

/// 日志中隐藏URL里的密码
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}

async fn forward_deliveries(
    inner: Arc<Inner>,
    queue: String,
    ack_mode: AckMode,
    (mut consumer, mut generation): (Consumer, u64),
    tx: mpsc::Sender<Result<Delivery>>,
) {
    loop {
        while let Some(item) = consumer.next().await {
            match item {
                Ok(delivery) => {
                    let message = Delivery {
                        delivery_tag: delivery.delivery_tag,
                        queue: queue.clone(),
                        priority: delivery.properties.priority().unwrap_or(0),
                        redelivered: delivery.redelivered,
                        payload: delivery.data,
                        session: generation,
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        debug!("队列 {} 的订阅者已关闭", queue);
                        return;
                    }
                }
                Err(e) => {
                    warn!("队列 {} 消费失败: {}", queue, e);
                    break;
                }
            }
        }

        if tx.is_closed() || inner.closed.load(Ordering::SeqCst) {
            return;
        }

        warn!("队列 {} 的消费者已断开 (会话 #{})，尝试重连", queue, generation);
        match inner.restart_consumer(&queue, ack_mode).await {
            Ok(started) => (consumer, generation) = started,
            Err(e) => {
                error!("RabbitMQ重连失败，停止消费队列 {}: {}", queue, e);
                let _ = tx
                    .send(Err(AutoreduceError::Broker(format!(
                        "无法恢复与RabbitMQ的连接: {e}"
                    ))))
                    .await;
                return;
            }
        }
    }
}

#[async_trait]
impl BrokerClient for RabbitMqBroker {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        self.inner.acquire().await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, queue: &str, ack_mode: AckMode) -> Result<DeliveryReceiver> {
        let started = self.inner.start_consumer(queue, ack_mode).await?;
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

        tokio::spawn(forward_deliveries(
            Arc::clone(&self.inner),
            queue.to_string(),
            ack_mode,
            started,
            tx,
        ));

        Ok(rx)
    }

    async fn send(&self, queue: &str, payload: &[u8], priority: u8) -> Result<()> {
        let (channel, generation) = self.inner.acquire().await?;

        let published = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_priority(priority.min(self.inner.config.max_priority)),
            )
            .await;
        let confirm = match published {
            Ok(confirm) => confirm,
            Err(e) => {
                self.inner.invalidate(generation).await;
                return Err(AutoreduceError::Broker(format!(
                    "发布消息到队列 {queue} 失败: {e}"
                )));
            }
        };

        let confirmation = confirm
            .await
            .map_err(|e| AutoreduceError::Broker(format!("消息发布确认失败: {e}")))?;
        if confirmation.is_nack() {
            return Err(AutoreduceError::Broker(format!(
                "RabbitMQ拒绝了发往队列 {queue} 的消息"
            )));
        }

        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let tag = delivery.delivery_tag;
        let session = self.inner.session.lock().await;
        let channel = match session.as_ref() {
            Some(s) if s.generation == delivery.session => &s.channel,
            _ => {
                return Err(AutoreduceError::Broker(format!(
                    "消息 {tag} 所在的会话 #{} 已关闭, 将由RabbitMQ重新投递",
                    delivery.session
                )))
            }
        };

        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| AutoreduceError::Broker(format!("确认消息 {tag} 失败: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.inner.session.lock().await.take() {
            session
                .connection
                .close(200, "正常关闭")
                .await
                .map_err(|e| AutoreduceError::Broker(format!("关闭连接失败: {e}")))?;
            info!("RabbitMQ连接已关闭");
        }
        Ok(())
    }
}
