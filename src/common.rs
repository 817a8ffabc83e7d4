use std::time::Duration;

use anyhow::{Context, Result};
use archiver_config::{AppConfig, ConfigValidator, DispatcherConfig};
use archiver_dispatcher::{LostTaskMonitorConfig, TaskManager};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，`RUST_LOG` 优先于传入的级别
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

/// 命令行对配置文件的覆盖项
#[derive(Debug, Clone, Default)]
pub struct WorkerOverrides {
    pub threads: Option<usize>,
    pub features: Option<Vec<String>>,
    pub tasks: Option<Vec<String>>,
    pub division: Option<String>,
    pub run_seconds: Option<u64>,
    pub debug: bool,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_ext: Option<String>,
}

/// 加载配置并应用命令行覆盖，覆盖后重新校验
pub fn load_config(config_path: Option<&str>, overrides: WorkerOverrides) -> Result<AppConfig> {
    let mut config = match config_path {
        Some(path) => {
            AppConfig::load(Some(path)).with_context(|| format!("加载配置文件失败: {path}"))?
        }
        None => AppConfig::load(None).context("加载配置失败")?,
    };
    apply_overrides(&mut config, overrides)?;
    config.validate().context("命令行参数校验失败")?;
    Ok(config)
}

fn apply_overrides(config: &mut AppConfig, overrides: WorkerOverrides) -> Result<()> {
    let worker = &mut config.worker;
    if let Some(threads) = overrides.threads {
        worker.threads = threads;
    }
    if let Some(features) = overrides.features {
        worker.features = features;
    }
    if let Some(tasks) = overrides.tasks {
        worker.tasks = tasks;
    }
    if let Some(division) = overrides.division {
        worker.division = division;
    }
    if let Some(run_seconds) = overrides.run_seconds {
        worker.run_seconds = run_seconds;
    }
    worker.debug |= overrides.debug;

    let observability = &mut config.observability;
    if let Some(level) = overrides.log_level {
        observability.log_level = level.parse().map_err(anyhow::Error::msg)?;
    }
    if let Some(format) = overrides.log_format {
        observability.log_format = format.parse().map_err(anyhow::Error::msg)?;
    }
    if overrides.log_ext.is_some() {
        observability.log_ext = overrides.log_ext;
    }
    Ok(())
}

/// 服务在日志中的名称：`<服务名>-<主机名>[-<后缀>]`
pub fn service_label(service_name: &str, host: &str, log_ext: Option<&str>) -> String {
    [Some(service_name), Some(host), log_ext]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// 当前主机名，取不到时为 `unknown`
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 按配置构造调度核心，供嵌入控制面使用
pub fn build_task_manager(config: &DispatcherConfig, division: &str) -> TaskManager {
    TaskManager::new(division)
        .with_max_resources(config.max_resources.clone())
        .with_staleness_threshold(chrono::Duration::seconds(
            config.staleness_threshold_seconds as i64,
        ))
}

pub fn lost_task_monitor_config(config: &DispatcherConfig) -> LostTaskMonitorConfig {
    LostTaskMonitorConfig {
        check_interval: Duration::from_secs(config.monitor_interval_seconds),
    }
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_config::{LogLevel, OutputFormat};

    #[test]
    fn test_overrides_replace_config_values() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            WorkerOverrides {
                threads: Some(4),
                features: Some(vec!["hsi_1".to_string()]),
                tasks: Some(vec!["put".to_string(), "pull".to_string()]),
                division: Some("nmdc".to_string()),
                run_seconds: Some(0),
                debug: true,
                log_level: Some("debug".to_string()),
                log_format: Some("json".to_string()),
                log_ext: Some("tape".to_string()),
            },
        )
        .unwrap();

        assert_eq!(config.worker.threads, 4);
        assert_eq!(config.worker.features, vec!["hsi_1".to_string()]);
        assert_eq!(config.worker.tasks.len(), 2);
        assert_eq!(config.worker.division, "nmdc");
        assert_eq!(config.worker.run_seconds, 0);
        assert!(config.worker.debug);
        assert_eq!(config.observability.log_level, LogLevel::Debug);
        assert_eq!(config.observability.log_format, OutputFormat::Json);
        assert_eq!(config.observability.log_ext.as_deref(), Some("tape"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = AppConfig::default();
        apply_overrides(&mut config, WorkerOverrides::default()).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = AppConfig::default();
        let overrides = WorkerOverrides {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(apply_overrides(&mut config, overrides).is_err());
    }

    #[test]
    fn test_service_label() {
        assert_eq!(service_label("dt_service", "dtn01", None), "dt_service-dtn01");
        assert_eq!(
            service_label("dt_service", "dtn01", Some("tape")),
            "dt_service-dtn01-tape"
        );
        assert_eq!(service_label("dt_service", "dtn01", Some("")), "dt_service-dtn01");
    }

    #[test]
    fn test_task_manager_from_dispatcher_config() {
        let mut config = DispatcherConfig::default();
        config.max_resources.insert("hsi_1".to_string(), 2);
        config.monitor_interval_seconds = 30;

        let manager = build_task_manager(&config, "jgi");
        assert_eq!(manager.resource_count("hsi_1"), 0);
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(
            lost_task_monitor_config(&config).check_interval,
            Duration::from_secs(30)
        );
    }
}
