use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use autoreduce_core::{
    traits::{AckMode, BrokerClient, Delivery, DeliveryReceiver},
    AutoreduceError, Result,
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const DELIVERY_BUFFER: usize = 1024;

/// 内存消息代理
///
/// 用于嵌入式部署和测试: 发送到已订阅队列的消息直接投递给订阅者,
/// 未订阅的队列先积压, 订阅时一次性投递。所有发送都保留历史记录。
/// `fail_connection` 结束当前会话, 之前会话的投递不能再确认。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_tag: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<String, (mpsc::Sender<Result<Delivery>>, AckMode)>,
    backlog: HashMap<String, VecDeque<(Vec<u8>, u8)>>,
    history: HashMap<String, Vec<Vec<u8>>>,
    unacked: HashSet<u64>,
    acked: Vec<u64>,
    session: u64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发送到指定队列的全部消息 (按发送顺序)
    pub async fn sent_to(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state.history.get(queue).cloned().unwrap_or_default()
    }

    pub async fn acked_tags(&self) -> Vec<u64> {
        self.state.lock().await.acked.clone()
    }

    /// 模拟连接不可恢复: 所有订阅者收到致命错误
    pub async fn fail_connection(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.session += 1;
        state.unacked.clear();
        for (queue, (tx, _)) in state.subscribers.drain() {
            debug!("向队列 {} 的订阅者投递连接错误", queue);
            let _ = tx
                .send(Err(AutoreduceError::Broker(reason.to_string())))
                .await;
        }
    }

    fn next_delivery(&self, session: u64, queue: &str, payload: Vec<u8>, priority: u8) -> Delivery {
        Delivery {
            delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            queue: queue.to_string(),
            payload,
            priority,
            redelivered: false,
            session,
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, queue: &str, ack_mode: AckMode) -> Result<DeliveryReceiver> {
        let mut state = self.state.lock().await;
        if state.subscribers.contains_key(queue) {
            return Err(AutoreduceError::Broker(format!("队列 {queue} 已有订阅者")));
        }

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let pending = state.backlog.remove(queue).unwrap_or_default();
        for (payload, priority) in pending {
            let delivery = self.next_delivery(state.session, queue, payload, priority);
            if ack_mode == AckMode::Client {
                state.unacked.insert(delivery.delivery_tag);
            }
            tx.send(Ok(delivery))
                .await
                .map_err(|_| AutoreduceError::Broker("订阅通道已关闭".to_string()))?;
        }

        state.subscribers.insert(queue.to_string(), (tx, ack_mode));
        Ok(rx)
    }

    async fn send(&self, queue: &str, payload: &[u8], priority: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .history
            .entry(queue.to_string())
            .or_default()
            .push(payload.to_vec());

        let subscriber = state.subscribers.get(queue).cloned();
        match subscriber {
            Some((tx, ack_mode)) => {
                let delivery =
                    self.next_delivery(state.session, queue, payload.to_vec(), priority);
                if ack_mode == AckMode::Client {
                    state.unacked.insert(delivery.delivery_tag);
                }
                if tx.send(Ok(delivery)).await.is_err() {
                    state.subscribers.remove(queue);
                    return Err(AutoreduceError::Broker(format!(
                        "队列 {queue} 的订阅者已关闭"
                    )));
                }
            }
            None => {
                state
                    .backlog
                    .entry(queue.to_string())
                    .or_default()
                    .push_back((payload.to_vec(), priority));
            }
        }

        debug!("消息已发布到内存队列: {}", queue);
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if delivery.session != state.session {
            return Err(AutoreduceError::Broker(format!(
                "投递 {} 所在的会话已断开",
                delivery.delivery_tag
            )));
        }
        if !state.unacked.remove(&delivery.delivery_tag) {
            return Err(AutoreduceError::Broker(format!(
                "未知的投递标签: {}",
                delivery.delivery_tag
            )));
        }
        state.acked.push(delivery.delivery_tag);
        Ok(())
    }
}
