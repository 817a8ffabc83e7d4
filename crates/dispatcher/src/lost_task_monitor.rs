use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use archiver_domain::Task;

use crate::task_manager::TaskManager;

/// 失联任务检测配置
#[derive(Debug, Clone)]
pub struct LostTaskMonitorConfig {
    /// 检测间隔
    pub check_interval: Duration,
}

impl Default for LostTaskMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// 周期性调用 [`TaskManager::monitor_lost_tasks`] 的后台服务
pub struct LostTaskMonitor {
    manager: Arc<Mutex<TaskManager>>,
    config: LostTaskMonitorConfig,
    running: Arc<RwLock<bool>>,
}

impl LostTaskMonitor {
    pub fn new(manager: Arc<Mutex<TaskManager>>, config: Option<LostTaskMonitorConfig>) -> Self {
        Self {
            manager,
            config: config.unwrap_or_default(),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 执行一次检测，返回被回收的任务
    pub async fn run_once(&self) -> Vec<Task> {
        let reclaimed = self.manager.lock().await.monitor_lost_tasks();
        for task in &reclaimed {
            warn!(
                task_id = %task.task_id,
                task = %task.task_name,
                service_id = %task.service_id,
                "任务所属服务失联，任务已回收"
            );
        }
        reclaimed
    }

    /// 启动检测循环，直到调用 [`stop`](Self::stop)
    pub async fn start(&self) {
        *self.running.write().await = true;
        info!(
            interval_seconds = self.config.check_interval.as_secs(),
            "启动失联任务检测"
        );

        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            interval.tick().await;
            if !*self.running.read().await {
                info!("收到停止信号，退出失联任务检测循环");
                break;
            }
            let reclaimed = self.run_once().await;
            debug!(count = reclaimed.len(), "失联任务检测完成");
        }
    }

    pub async fn stop(&self) {
        info!("停止失联任务检测");
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
