use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use hca_config::{AppConfig, LogLevel, OutputFormat};
use hca_pipeline::logging::init_logging;
use hca_pipeline::shutdown::{wait_for_signal, ShutdownManager};
use hca_pipeline::{AppMode, Application};
use tracing::{info, warn};

fn cli() -> Command {
    Command::new("hca-pipeline")
        .version("1.0.0")
        .about("高内涵图像分析作业分发与完成跟踪")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找 config/hca.toml、hca.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["submit", "worker", "consolidator", "all"])
                .default_value("worker"),
        )
        .arg(
            Arg::new("request")
                .short('r')
                .long("request")
                .value_name("FILE")
                .help("提交请求 JSON 文件")
                .required_if_eq("mode", "submit"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("工作节点ID，覆盖配置中的 worker.worker_id"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .help("all 模式下启动的工作节点数")
                .value_parser(clap::value_parser!(usize))
                .default_value("1"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，缺省使用配置中的 observability.log_level")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
}

fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;

    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = id.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format
            .parse::<OutputFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    init_logging(
        &config.observability.log_level.to_string(),
        config.observability.log_format,
    )?;

    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("worker")
        .parse()?;
    info!("启动 hca-pipeline，运行模式: {:?}", mode);

    let mut app = Application::new(config, mode).await?;
    if let Some(request) = matches.get_one::<String>("request") {
        app = app.with_request(request);
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        app = app.with_workers(*workers);
    }

    let shutdown_manager = ShutdownManager::new();
    let run = app.run(shutdown_manager.subscribe());
    tokio::pin!(run);

    let report = tokio::select! {
        report = &mut run => report?,
        _ = wait_for_signal() => {
            info!("收到关闭信号，等待当前任务结束...");
            shutdown_manager.shutdown();
            match tokio::time::timeout(Duration::from_secs(30 * 60), &mut run).await {
                Ok(report) => report?,
                Err(_) => {
                    warn!("等待当前任务结束超时，强制退出");
                    return Ok(());
                }
            }
        }
    };

    if let Some(dispatch) = &report.dispatch {
        println!("{}", serde_json::to_string_pretty(dispatch)?);
    }
    for summary in &report.workers {
        info!("工作节点统计: {:?}", summary);
    }
    if let Some(summary) = &report.consolidator {
        info!("合并器统计: {:?}", summary);
    }
    info!("hca-pipeline 已退出");
    Ok(())
}
