use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autoreduce_core::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::Application;
use crate::shutdown::{wait_for_os_signal, ShutdownSignal};

/// 命令行给出的启动参数; 未给出的日志参数取自配置文件
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// 初始化日志系统
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 加载应用配置
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let path = startup_config.config_path.as_deref();
    AppConfig::load(path).with_context(|| match path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })
}

/// 启动应用程序并运行到关闭
pub async fn start_application(startup_config: StartupConfig) -> Result<()> {
    let config = load_config(&startup_config)?;

    let log_level = startup_config
        .log_level
        .as_deref()
        .unwrap_or(config.observability.log_level.as_str());
    let log_format = startup_config
        .log_format
        .as_deref()
        .unwrap_or(config.observability.log_format.as_str());
    init_logging(log_level, log_format)?;

    info!("启动自动约简调度器");
    match &startup_config.config_path {
        Some(path) => info!("配置文件: {}", path),
        None => info!("使用默认配置路径"),
    }
    info!(
        "待处理队列: {}, 记录存储: {:?}",
        config.broker.pending_queue, config.record_store.r#type
    );

    let drain = Duration::from_secs(config.dispatcher.shutdown_drain_seconds + 5);
    let app = Arc::new(Application::new(config).await?);
    let shutdown = ShutdownSignal::new();

    let mut app_handle = {
        let shutdown_rx = shutdown.subscribe();
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_os_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            // 调度器自行退出: 消息代理不可恢复
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用运行失败: {:#}", e);
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("应用任务异常: {e}")),
            };
        }
    }

    shutdown.trigger();

    tokio::select! {
        drained = tokio::time::timeout(drain, app_handle) => match drained {
            Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
            Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {:#}", e),
            Ok(Err(e)) => error!("应用任务异常: {}", e),
            Err(_) => warn!("应用关闭超时，强制退出"),
        },
        _ = wait_for_os_signal() => warn!("再次收到关闭信号，强制退出"),
    }

    info!("自动约简调度器已退出");
    Ok(())
}
