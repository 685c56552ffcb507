use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// 消费确认模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// 投递即确认
    Auto,
    /// 由客户端调用 `ack` 确认
    Client,
}

/// 一条投递到消费者的消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub priority: u8,
    pub redelivered: bool,
    /// 产生该投递的连接会话代次, 确认只能在同一会话上进行
    pub session: u64,
}

/// 订阅得到的投递流; `Err` 表示连接已不可恢复, 消费必须停止
pub type DeliveryReceiver = mpsc::Receiver<Result<Delivery>>;

/// 消息代理客户端抽象接口
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// 建立连接, 失败时按退避策略重试
    async fn connect(&self) -> Result<()>;

    /// 订阅队列
    async fn subscribe(&self, queue: &str, ack_mode: AckMode) -> Result<DeliveryReceiver>;

    /// 发送持久化消息
    async fn send(&self, queue: &str, payload: &[u8], priority: u8) -> Result<()>;

    /// 在产生该投递的会话上确认消息; 会话已重建时返回错误, 消息由代理重新投递
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// 关闭连接
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
