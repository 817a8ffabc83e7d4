use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use archiver_config::AppConfig;
use archiver_domain::{ControlPlane, ControlledVocabulary, QueueSnapshot, ServiceRegistration};
use archiver_worker::{
    CommandRunner, HandlerContext, HandlerRegistry, HttpControlPlane, HttpStatusProbe,
    ServiceProbe, TokioCommandRunner, WorkerRuntime,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::common::{host_name, service_label};

/// 数据传输服务
///
/// 向控制面注册后按心跳间隔循环：上报心跳、检查磁带服务、
/// 在允许的队列有积压时补齐Worker，直到运行时间耗尽或收到关闭信号。
pub struct Application {
    config: AppConfig,
    control_plane: Arc<dyn ControlPlane>,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ServiceProbe>,
    host: String,
}

impl Application {
    /// 按配置创建HTTP控制面客户端、磁带状态探针和命令执行器
    pub fn new(config: AppConfig) -> Result<Self> {
        let cp = &config.control_plane;
        let token = cp.token().context("读取控制面访问令牌失败")?;
        let control_plane = HttpControlPlane::new(
            cp.url.clone(),
            token,
            Duration::from_secs(cp.request_timeout_seconds),
        )
        .context("创建控制面客户端失败")?
        .with_retries(cp.max_retries, Duration::from_secs(cp.retry_delay_seconds));

        let probe = HttpStatusProbe::new(
            config.tape_status.status_url.clone(),
            config.tape_status.server_names.clone(),
            Duration::from_secs(config.tape_status.cache_seconds),
        );

        Ok(Self::with_components(
            config,
            Arc::new(control_plane),
            Arc::new(TokioCommandRunner::new()),
            Arc::new(probe),
        ))
    }

    pub fn with_components(
        config: AppConfig,
        control_plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        Self {
            config,
            control_plane,
            runner,
            probe,
            host: host_name(),
        }
    }

    /// 运行服务直到运行时间耗尽或 `shutdown_rx` 收到信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let label = service_label(
            &self.config.worker.service_name,
            &self.host,
            self.config.observability.log_ext.as_deref(),
        );
        self.run_service(shutdown_rx)
            .instrument(info_span!("service", service = %label))
            .await
    }

    async fn run_service(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let worker = &self.config.worker;
        let registration = ServiceRegistration {
            tasks: worker.tasks.clone(),
            hostname: self.host.clone(),
            available_threads: worker.threads,
            seconds_to_run: worker.run_seconds,
            division: worker.division.clone(),
        };
        let service_id = self
            .control_plane
            .register_service(&registration)
            .await
            .context("注册服务失败")?;
        info!(
            service_id = %service_id,
            division = %worker.division,
            threads = worker.threads,
            features = ?worker.features,
            tasks = ?worker.tasks,
            "服务已注册"
        );

        let result = match self.build_runtime(&service_id).await {
            Ok(runtime) => {
                let runtime = Arc::new(runtime);
                self.heartbeat_loop(&runtime, &mut shutdown_rx).await;
                info!(active = runtime.active_count(), "停止服务，等待Worker完成当前任务");
                runtime.stop();
                runtime.wait().await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.control_plane.end_service(&service_id).await {
            warn!(service_id = %service_id, error = %e, "上报服务结束失败");
        }
        info!(service_id = %service_id, "服务已结束");
        result
    }

    /// 读取站点配置和受控词表，组装Worker运行时
    async fn build_runtime(&self, service_id: &str) -> Result<WorkerRuntime> {
        let worker = &self.config.worker;
        let cwd = std::env::current_dir().context("获取当前目录失败")?;
        let settings = self
            .control_plane
            .tape_settings()
            .await
            .context("获取站点配置失败")?
            .for_division(&worker.division, &cwd);
        let tables = self
            .control_plane
            .vocabulary()
            .await
            .context("获取受控词表失败")?;
        let vocabulary = ControlledVocabulary::from_tables(&tables).context("受控词表不完整")?;
        debug!(temp_dir = %settings.temp_dir.display(), "站点配置已加载");

        let ctx = HandlerContext::new(
            self.control_plane.clone(),
            self.runner.clone(),
            self.probe.clone(),
            Arc::new(settings),
            Arc::new(vocabulary),
            worker.division.clone(),
        )
        .with_debug(worker.debug);
        if worker.debug {
            warn!("调试模式：跳过所有磁带读写命令");
        }

        Ok(WorkerRuntime::new(
            Arc::new(ctx),
            Arc::new(HandlerRegistry::with_defaults()),
            service_id,
            worker.tasks.clone(),
            worker.features.clone(),
        ))
    }

    async fn heartbeat_loop(
        &self,
        runtime: &Arc<WorkerRuntime>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let worker = &self.config.worker;
        let interval = Duration::from_secs(worker.heartbeat_interval_seconds);
        let run_for = Duration::from_secs(worker.run_seconds);
        let started = Instant::now();

        loop {
            let queues = match self
                .control_plane
                .heartbeat(&worker.division, runtime.service_id())
                .await
            {
                Ok(queues) => queues,
                Err(e) => {
                    warn!(error = %e, "心跳失败，本轮不启动Worker");
                    HashMap::new()
                }
            };

            runtime.check_services().await;

            if worker.run_seconds > 0 && started.elapsed() >= run_for {
                info!(run_seconds = worker.run_seconds, "运行时间已到");
                break;
            }

            if has_pending_work(&queues, runtime.tasks()) {
                let spawned = runtime.set_threads(worker.threads).await;
                if spawned > 0 {
                    debug!(spawned, active = runtime.active_count(), "补齐Worker");
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// 允许执行的任务中是否有队列存在待处理记录
fn has_pending_work(queues: &HashMap<String, QueueSnapshot>, tasks: &[String]) -> bool {
    tasks
        .iter()
        .any(|task| queues.get(task).is_some_and(|q| q.record_count > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_testing_utils::{
        tape_settings, vocabulary_tables, MockCommandRunner, MockControlPlane, StaticProbe,
        TaskBuilder,
    };
    use serde_json::json;

    fn snapshot(record_count: usize) -> QueueSnapshot {
        QueueSnapshot {
            record_count,
            ..Default::default()
        }
    }

    fn app(control_plane: &MockControlPlane, config: AppConfig) -> Application {
        Application::with_components(
            config,
            Arc::new(control_plane.clone()),
            Arc::new(MockCommandRunner::new()),
            Arc::new(StaticProbe::new()),
        )
    }

    fn config(run_seconds: u64) -> AppConfig {
        let mut config = AppConfig::default();
        config.worker.run_seconds = run_seconds;
        config.worker.heartbeat_interval_seconds = 10;
        config.worker.tasks = vec!["md5".to_string()];
        config
    }

    #[test]
    fn test_pending_work_only_counts_allowed_tasks() {
        let queues = HashMap::from([
            ("put".to_string(), snapshot(3)),
            ("md5".to_string(), snapshot(0)),
        ]);
        assert!(!has_pending_work(&queues, &["md5".to_string()]));
        assert!(has_pending_work(&queues, &["md5".to_string(), "put".to_string()]));
        assert!(!has_pending_work(&HashMap::new(), &["put".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_runs_until_time_limit() {
        let temp = tempfile::tempdir().unwrap();
        let control_plane = MockControlPlane::new();
        {
            let mut state = control_plane.state();
            state.vocabulary = vocabulary_tables();
            state.settings = tape_settings(temp.path());
            state.heartbeat = HashMap::from([("md5".to_string(), snapshot(1))]);
            state.pending_tasks.push_back(
                TaskBuilder::new("md5")
                    .with_id("M1")
                    .with_data(json!({"md5_queue_id": 3, "file_path": "/data/a.fastq"}))
                    .build(),
            );
        }
        let manager = crate::shutdown::ShutdownManager::new();
        let app = app(&control_plane, config(25));

        app.run(manager.subscribe().await).await.unwrap();

        let state = control_plane.state();
        assert_eq!(state.registrations.len(), 1);
        assert_eq!(state.registrations[0].tasks, vec!["md5".to_string()]);
        assert_eq!(state.ended_services, vec!["1".to_string()]);
        assert_eq!(state.completed.len(), 1);
        assert_eq!(state.completed[0].task_id, "M1");
        assert_eq!(state.md5_updates.len(), 1);
        // 第0、10、20秒各补齐一次Worker，第30秒时间耗尽
        assert_eq!(state.claims.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_ends_service() {
        let temp = tempfile::tempdir().unwrap();
        let control_plane = MockControlPlane::new();
        {
            let mut state = control_plane.state();
            state.vocabulary = vocabulary_tables();
            state.settings = tape_settings(temp.path());
        }
        let manager = crate::shutdown::ShutdownManager::new();
        let app = Arc::new(app(&control_plane, config(0)));
        let rx = manager.subscribe().await;
        let handle = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };

        tokio::time::sleep(Duration::from_secs(15)).await;
        manager.shutdown().await;
        handle.await.unwrap().unwrap();

        let state = control_plane.state();
        assert_eq!(state.ended_services, vec!["1".to_string()]);
        assert!(state.claims.is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_vocabulary_fails_but_ends_service() {
        let control_plane = MockControlPlane::new();
        let manager = crate::shutdown::ShutdownManager::new();
        let app = app(&control_plane, config(0));

        assert!(app.run(manager.subscribe().await).await.is_err());
        assert_eq!(control_plane.state().ended_services.len(), 1);
    }
}
