//! 任务处理器
//!
//! 每种任务名对应一个 [`TaskHandler`]，启动时注册到 [`HandlerRegistry`] 后注入Worker运行时。
//! 处理器总是以一次状态更新结束（成功或失败），不会把记录留在不确定的状态。

mod copy;
mod delete;
mod ingest;
mod md5;
mod pull;
mod purge;
mod put;
mod tarball;

use std::collections::HashMap;
use std::fs::{DirBuilder, File, FileTimes};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use archiver_domain::{
    ArchiverError, ArchiverResult, BackupService, ControlPlane, ControlledVocabulary, Task,
    TapeSettings,
};

use crate::command::CommandRunner;
use crate::hsi::HsiClient;
use crate::probe::ServiceProbe;

pub use copy::{parse_rsync_stats, CopyHandler};
pub use delete::{DeleteHandler, GeneralHandler};
pub use ingest::IngestHandler;
pub use md5::Md5Handler;
pub use pull::{PrepHandler, PullHandler};
pub use purge::PurgeHandler;
pub use put::PutHandler;
pub use tarball::TarHandler;

/// 恢复和复制时新建目录的权限
pub const DIR_MODE: u32 = 0o751;

/// 复制完成后目标文件的权限
pub const FILE_MODE: u32 = 0o640;

/// 处理器共享的运行环境
pub struct HandlerContext {
    pub control_plane: Arc<dyn ControlPlane>,
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn ServiceProbe>,
    pub settings: Arc<TapeSettings>,
    pub vocabulary: Arc<ControlledVocabulary>,
    pub division: String,
    /// 为true时跳过所有磁带读写命令
    pub debug: bool,
    backup_services: RwLock<HashMap<i64, BackupService>>,
}

impl HandlerContext {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ServiceProbe>,
        settings: Arc<TapeSettings>,
        vocabulary: Arc<ControlledVocabulary>,
        division: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            runner,
            probe,
            settings,
            vocabulary,
            division: division.into(),
            debug: false,
            backup_services: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn hsi(&self) -> HsiClient {
        HsiClient::new(self.runner.clone())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.settings.temp_dir
    }

    /// 备份服务描述，首次查询后缓存
    pub async fn backup_service(&self, backup_service_id: i64) -> ArchiverResult<BackupService> {
        if let Some(service) = self.backup_services.read().await.get(&backup_service_id) {
            return Ok(service.clone());
        }
        let mut service = self
            .control_plane
            .backup_service(backup_service_id)
            .await?
            .ok_or_else(|| {
                ArchiverError::service_config(format!("未找到备份服务 {backup_service_id}"))
            })?;
        service.backup_service_id = backup_service_id;
        debug!(backup_service_id, name = %service.name, "缓存备份服务");
        self.backup_services
            .write()
            .await
            .insert(backup_service_id, service.clone());
        Ok(service)
    }

    /// 备份服务对应的磁带服务器地址
    pub fn tape_server<'a>(&self, service: &'a BackupService) -> ArchiverResult<&'a str> {
        service.server.as_deref().ok_or_else(|| {
            ArchiverError::service_config(format!("备份服务 {} 缺少 `server`", service.name))
        })
    }
}

/// 一种任务的处理逻辑
///
/// 返回值是上报给控制面的任务结果。`ResourceUnavailable` 错误表示任务应交还重新排队，
/// 其他错误会让当前Worker退出循环。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool>;
}

/// 任务名到处理器的静态分发表
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含全部内置处理器
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IngestHandler));
        registry.register(Arc::new(CopyHandler));
        registry.register(Arc::new(Md5Handler));
        registry.register(Arc::new(PutHandler));
        registry.register(Arc::new(PrepHandler));
        registry.register(Arc::new(PullHandler));
        registry.register(Arc::new(TarHandler));
        registry.register(Arc::new(GeneralHandler));
        registry.register(Arc::new(PurgeHandler));
        registry.register(Arc::new(DeleteHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 按组件判断 `path` 是否位于 `dir` 之下；空目录不匹配任何路径
pub fn is_under(path: &Path, dir: &Path) -> bool {
    !dir.as_os_str().is_empty() && path.starts_with(dir)
}

pub fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// 复制内容、权限和访问/修改时间
pub fn copy_preserving(source: &Path, destination: &Path) -> std::io::Result<u64> {
    let copied = std::fs::copy(source, destination)?;
    copy_times(source, destination)?;
    Ok(copied)
}

pub fn copy_times(source: &Path, destination: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(source)?;
    let times = FileTimes::new()
        .set_accessed(metadata.accessed()?)
        .set_modified(metadata.modified()?);
    File::open(destination)?.set_times(times)
}

/// 远端路径拆成 (目录, 文件名)
pub(crate) fn split_remote(remote: &str) -> (String, String) {
    match remote.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), remote.to_string()),
    }
}

pub(crate) fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// 在阻塞线程池中执行同步的文件系统工作
pub(crate) async fn blocking<T, F>(work: F) -> ArchiverResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ArchiverResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ArchiverError::Internal(format!("阻塞任务异常退出: {e}")))?
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}
