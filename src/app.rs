use std::sync::Arc;

use anyhow::{Context, Result};
use autoreduce_core::{
    config::RecordStoreType, AppConfig, BrokerClient, PathTranslator, ReductionExecutor,
    RunStateStore,
};
use autoreduce_dispatcher::{Dispatcher, JobValidator};
use autoreduce_infrastructure::{InMemoryRunStore, PostgresRunStore, RabbitMqBroker};
use autoreduce_worker::ScriptExecutor;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 主应用程序: 按配置装配消息代理、记录存储、执行器和调度器
pub struct Application {
    broker: Arc<dyn BrokerClient>,
    dispatcher: Dispatcher,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let broker: Arc<dyn BrokerClient> = Arc::new(RabbitMqBroker::new(config.broker.clone()));
        let store = create_run_store(&config).await?;
        Ok(Self::with_components(&config, broker, store))
    }

    /// 使用给定的消息代理和记录存储装配
    pub fn with_components(
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn RunStateStore>,
    ) -> Self {
        let translator = PathTranslator::from_config(&config.paths);
        let executor: Arc<dyn ReductionExecutor> = Arc::new(ScriptExecutor::new(
            config.executor.clone(),
            config.paths.clone(),
        ));
        let validator = JobValidator::from_config(&config.dispatcher, translator);

        let dispatcher = Dispatcher::new(config, Arc::clone(&broker), store, executor, validator);
        Self { broker, dispatcher }
    }

    /// 运行直到收到关闭信号或消息代理不可恢复
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动约简作业调度器");
        let result = self.dispatcher.run(shutdown_rx).await;

        if let Err(e) = self.broker.close().await {
            warn!("关闭消息代理连接失败: {}", e);
        }

        result.context("调度器异常退出")
    }
}

async fn create_run_store(config: &AppConfig) -> Result<Arc<dyn RunStateStore>> {
    match config.record_store.r#type {
        RecordStoreType::Memory => {
            warn!("使用内存记录存储, 重启后运行记录将丢失");
            Ok(Arc::new(InMemoryRunStore::new()))
        }
        RecordStoreType::Postgres => {
            let store = PostgresRunStore::connect(&config.record_store)
                .await
                .context("连接记录数据库失败")?;
            info!("已连接记录数据库");
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoreduce_infrastructure::InMemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_application_stops_on_shutdown() {
        let config = AppConfig::default();
        let app = Application::with_components(
            &config,
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryRunStore::new()),
        );

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { app.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_broker_failure_is_fatal() {
        let config = AppConfig::default();
        let broker = InMemoryBroker::new();
        let app = Application::with_components(
            &config,
            Arc::new(broker.clone()),
            Arc::new(InMemoryRunStore::new()),
        );

        let (_tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { app.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.fail_connection("connection refused").await;

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }
}
