use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info};

use jobqueue::app::{mask_redis_url, AppMode, Application};
use jobqueue::shutdown::{wait_for_signal, ShutdownManager};
use jobqueue_config::{AppConfig, LogFormat, StoreBackend};
use jobqueue_infrastructure::{init_logging, init_metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("jobqueue")
        .version("1.0.0")
        .about("分布式作业队列与Worker池")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["worker", "supervisor", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID，覆盖配置中的 worker.worker_id"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let mut config = AppConfig::load(config_path).context("加载配置失败")?;

    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = id.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    init_logging(&config.logging.level, config.logging.format)?;

    info!("启动分布式作业队列");
    info!("配置文件: {}", config_path.unwrap_or("<默认路径>"));
    info!("运行模式: {mode_str}");
    match config.store.backend {
        StoreBackend::Redis => info!("存储: {}", mask_redis_url(&config.store.redis_url)),
        StoreBackend::Memory => info!("存储: 进程内"),
    }

    let app_mode: AppMode = mode_str.parse()?;

    if config.metrics.enabled {
        init_metrics(&config.metrics.listen_address)?;
    }

    let app = Arc::new(Application::new(config, app_mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown();
            if shutdown_manager.drain(app_handle).await.is_some() {
                info!("应用已优雅关闭");
            }
        }
        // Worker达到作业上限或启动失败时应用自行结束
        result = &mut app_handle => {
            if let Err(e) = result {
                error!("应用任务异常退出: {e}");
            }
        }
    }

    info!("分布式作业队列已退出");
    Ok(())
}
