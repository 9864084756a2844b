use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use broker_core::{AppConfig, ObservabilityConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vdi_broker::shutdown::wait_for_shutdown_signal;
use vdi_broker::{Application, ShutdownManager};

fn cli() -> Command {
    Command::new("vdi-broker")
        .version("1.0.0")
        .about("虚拟桌面连接代理后台任务管理器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("打印合并后的配置并退出")
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("run").about("运行作业调度与延迟任务循环（默认）"))
        .subcommand(Command::new("jobs").about("注册内置作业并列出作业状态"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    apply_overrides(&mut config.observability, &matches);

    if matches.get_flag("print-config") {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    match matches.subcommand_name() {
        Some("jobs") => list_jobs(config).await,
        _ => run(config).await,
    }
}

fn apply_overrides(observability: &mut ObservabilityConfig, matches: &ArgMatches) {
    if let Some(level) = matches.get_one::<String>("log-level") {
        observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        observability.log_format = format.clone();
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("启动虚拟桌面连接代理后台任务管理器");

    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
    }

    let shutdown_timeout = Duration::from_secs(config.scheduler.shutdown_timeout_seconds);
    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown = shutdown_manager.token();
        tokio::spawn(async move { app.run(shutdown).await })
    };

    tokio::select! {
        result = &mut app_handle => {
            // 应用在收到关闭信号前退出，通常是启动失败
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
        result = wait_for_shutdown_signal() => {
            if let Err(e) = result {
                error!("等待关闭信号失败: {e:#}");
            }
        }
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    // 工作循环自身也受关闭超时约束，这里额外留出关闭数据库的时间
    match tokio::time::timeout(shutdown_timeout + Duration::from_secs(5), app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("虚拟桌面连接代理后台任务管理器已退出");
    Ok(())
}

async fn list_jobs(config: AppConfig) -> Result<()> {
    let app = Application::new(config).await?;
    app.register_jobs().await?;

    println!(
        "{:<24} {:<24} {:>8}  {:<26} {}",
        "NAME", "KIND", "INTERVAL", "NEXT EXECUTION", "LEASE OWNER"
    );
    for job in app.list_jobs().await? {
        println!(
            "{:<24} {:<24} {:>8}  {:<26} {}",
            job.name,
            job.kind,
            job.interval_seconds,
            job.next_execution_time.to_rfc3339(),
            job.lease_owner.as_deref().unwrap_or("-"),
        );
    }

    app.database().close().await;
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
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

/// 安装Prometheus指标导出器
fn init_metrics(bind_address: &str) -> Result<()> {
    let address: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("指标监听地址格式无效: {bind_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {e}"))?;

    info!("Prometheus指标导出器监听于 {address}");
    Ok(())
}
