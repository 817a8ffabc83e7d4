use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};

use archiver::app::Application;
use archiver::common::{init_logging, load_config, wait_for_shutdown_signal, WorkerOverrides};
use archiver_config::{OutputFormat, ValidationUtils};
use archiver::shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("archiver")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据归档传输服务")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("同时运行的Worker数量")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("features")
                .short('f')
                .long("features")
                .value_name("LIST")
                .help("本服务提供的特性，逗号分隔，例如 hsi_1,dna_w"),
        )
        .arg(
            Arg::new("tasks")
                .short('k')
                .long("tasks")
                .value_name("LIST")
                .help("允许执行的任务，逗号分隔"),
        )
        .arg(
            Arg::new("division")
                .short('d')
                .long("division")
                .value_name("NAME")
                .help("所属部门"),
        )
        .arg(
            Arg::new("run-seconds")
                .long("run-seconds")
                .value_name("SECONDS")
                .help("运行多少秒后退出，0表示一直运行")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("调试模式，不执行磁带读写命令")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("log-ext")
                .long("log-ext")
                .value_name("SUFFIX")
                .help("服务名后缀，用于区分同一主机上的多个服务"),
        )
        .get_matches();

    let overrides = WorkerOverrides {
        threads: matches.get_one::<usize>("threads").copied(),
        features: matches.get_one::<String>("features").map(|v| ValidationUtils::split_list(v)),
        tasks: matches.get_one::<String>("tasks").map(|v| ValidationUtils::split_list(v)),
        division: matches.get_one::<String>("division").cloned(),
        run_seconds: matches.get_one::<u64>("run-seconds").copied(),
        debug: matches.get_flag("debug"),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format: matches.get_one::<String>("log-format").cloned(),
        log_ext: matches.get_one::<String>("log-ext").cloned(),
    };

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = load_config(config_path, overrides)?;

    let log_format = match config.observability.log_format {
        OutputFormat::Json => "json",
        OutputFormat::Pretty => "pretty",
    };
    init_logging(&config.observability.log_level.to_string(), log_format)?;

    info!("启动数据归档传输服务");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let app = Arc::new(Application::new(config)?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    // 运行时间耗尽时服务自行结束
    let finished = tokio::select! {
        result = &mut app_handle => Some(result),
        _ = wait_for_shutdown_signal() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("收到关闭信号，等待正在执行的任务完成...");
            shutdown_manager.shutdown().await;
            tokio::select! {
                result = &mut app_handle => result,
                _ = wait_for_shutdown_signal() => {
                    warn!("再次收到关闭信号，强制退出");
                    app_handle.abort();
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => info!("数据归档传输服务已退出"),
        Ok(Err(e)) => {
            error!("服务运行失败: {e:#}");
            return Err(e);
        }
        Err(e) => error!("服务任务异常结束: {e}"),
    }
    Ok(())
}
