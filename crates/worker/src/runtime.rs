//! Worker运行时：一组共享停止标志的tokio任务，循环领取并执行任务

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use archiver_domain::{ArchiverError, ArchiverResult, ClaimRequest, Task, TaskOutcome};

use crate::handlers::{HandlerContext, HandlerRegistry};

/// 磁带资源特性名的前缀，后接备份服务id
pub const TAPE_RESOURCE_PREFIX: &str = "hsi_";

pub struct WorkerRuntime {
    ctx: Arc<HandlerContext>,
    registry: Arc<HandlerRegistry>,
    service_id: String,
    tasks: Vec<String>,
    features: RwLock<Vec<String>>,
    /// 已上报下线、等待恢复的磁带资源
    offline: Mutex<BTreeSet<String>>,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Worker退出（包括panic）时递减活动计数
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerRuntime {
    pub fn new(
        ctx: Arc<HandlerContext>,
        registry: Arc<HandlerRegistry>,
        service_id: impl Into<String>,
        tasks: Vec<String>,
        features: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            registry,
            service_id: service_id.into(),
            tasks,
            features: RwLock::new(features),
            offline: Mutex::new(BTreeSet::new()),
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub async fn features(&self) -> Vec<String> {
        self.features.read().await.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// 补足Worker数量到 `threads`，返回新启动的数量
    pub async fn set_threads(self: &Arc<Self>, threads: usize) -> usize {
        if self.is_stopping() {
            return 0;
        }
        let mut workers = self.workers.lock().await;
        workers.retain(|handle| !handle.is_finished());

        let mut started = 0;
        while self.active.load(Ordering::SeqCst) < threads {
            self.active.fetch_add(1, Ordering::SeqCst);
            let guard = ActiveGuard(self.active.clone());
            let runtime = Arc::clone(self);
            let worker = workers.len();
            workers.push(tokio::spawn(async move {
                let _guard = guard;
                runtime.run_worker(worker).await;
            }));
            started += 1;
        }
        if started > 0 {
            info!(started, active = self.active_count(), "启动Worker");
        }
        started
    }

    /// 通知所有Worker在当前任务结束后退出
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// 等待所有Worker退出
    pub async fn wait(&self) {
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker异常退出");
            }
        }
    }

    async fn claim_request(&self) -> ClaimRequest {
        ClaimRequest {
            features: self.features().await,
            tasks: self.tasks.clone(),
            service_id: self.service_id.clone(),
            division: self.ctx.division.clone(),
        }
    }

    async fn dispatch(&self, task: &Task) -> ArchiverResult<bool> {
        let handler = self
            .registry
            .get(&task.task_name)
            .ok_or_else(|| ArchiverError::UnknownTask(task.task_name.clone()))?;
        handler.handle(&self.ctx, task).await
    }

    async fn run_worker(&self, worker: usize) {
        let control_plane = &self.ctx.control_plane;
        let mut pending: Option<TaskOutcome> = None;
        debug!(worker, "Worker开始领取任务");

        while !self.is_stopping() {
            let claim = self.claim_request().await;
            let task = match control_plane.complete_and_claim(pending.as_ref(), &claim).await {
                Ok(Some(task)) => {
                    pending = None;
                    task
                }
                Ok(None) => {
                    pending = None;
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "领取任务失败");
                    break;
                }
            };
            metrics::counter!("archiver_tasks_claimed_total").increment(1);
            info!(worker, task_id = %task.task_id, task = %task.task_name, "开始执行任务");

            match self.dispatch(&task).await {
                Ok(success) => {
                    let result = if success { "success" } else { "failure" };
                    metrics::counter!("archiver_tasks_completed_total", "result" => result)
                        .increment(1);
                    info!(worker, task_id = %task.task_id, success, "任务执行结束");
                    pending = Some(TaskOutcome {
                        task_id: task.task_id.clone(),
                        success,
                    });
                }
                Err(e) if e.is_resource_unavailable() => {
                    warn!(worker, task_id = %task.task_id, error = %e, "资源不可用，任务交还重新排队");
                    metrics::counter!("archiver_tasks_completed_total", "result" => "requeued")
                        .increment(1);
                    if let Err(e) = control_plane.requeue_task(&task).await {
                        error!(task_id = %task.task_id, error = %e, "任务交还失败");
                    }
                    break;
                }
                Err(e) => {
                    error!(worker, task_id = %task.task_id, task = %task.task_name, error = %e, "任务执行出错");
                    metrics::counter!("archiver_tasks_completed_total", "result" => "error")
                        .increment(1);
                    pending = Some(TaskOutcome {
                        task_id: task.task_id.clone(),
                        success: false,
                    });
                    break;
                }
            }
        }

        if let Some(outcome) = pending {
            if let Err(e) = control_plane
                .report_task_complete(&outcome, &self.ctx.division)
                .await
            {
                warn!(task_id = %outcome.task_id, error = %e, "上报任务结果失败");
            }
        }
        debug!(worker, "Worker退出");
    }

    /// 探测磁带服务：下线的资源从特性中移除并上报，恢复后重新加入
    pub async fn check_services(&self) {
        let mut candidates: BTreeSet<String> = self
            .features()
            .await
            .into_iter()
            .filter(|f| f.starts_with(TAPE_RESOURCE_PREFIX))
            .collect();
        candidates.extend(self.offline.lock().await.iter().cloned());

        for resource in candidates {
            let Some(backup_service_id) = resource
                .strip_prefix(TAPE_RESOURCE_PREFIX)
                .and_then(|id| id.parse::<i64>().ok())
            else {
                continue;
            };
            let up = match self.probe_backup_service(backup_service_id).await {
                Ok(up) => up,
                Err(e) => {
                    warn!(resource = %resource, error = %e, "无法探测磁带服务");
                    continue;
                }
            };
            let was_offline = self.offline.lock().await.contains(&resource);
            if !up && !was_offline {
                self.features.write().await.retain(|f| f != &resource);
                self.offline.lock().await.insert(resource.clone());
                warn!(resource = %resource, "磁带服务不可用，暂停相关任务");
                if let Err(e) = self
                    .ctx
                    .control_plane
                    .resource_offline(&resource, &self.service_id)
                    .await
                {
                    warn!(resource = %resource, error = %e, "上报资源下线失败");
                }
            } else if up && was_offline {
                self.offline.lock().await.remove(&resource);
                {
                    let mut features = self.features.write().await;
                    if !features.contains(&resource) {
                        features.push(resource.clone());
                    }
                }
                info!(resource = %resource, "磁带服务已恢复");
                if let Err(e) = self
                    .ctx
                    .control_plane
                    .resource_online(&resource, &self.service_id)
                    .await
                {
                    warn!(resource = %resource, error = %e, "上报资源上线失败");
                }
            }
        }
    }

    async fn probe_backup_service(&self, backup_service_id: i64) -> ArchiverResult<bool> {
        let service = self.ctx.backup_service(backup_service_id).await?;
        let server = self.ctx.tape_server(&service)?;
        Ok(self.ctx.probe.is_up(server).await)
    }
}
