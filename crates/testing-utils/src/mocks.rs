//! 外部协作者的内存实现
//!
//! 每个替身都记录收到的调用，测试结束后直接检查记录即可。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use archiver_domain::{
    ArchiverError, ArchiverResult, BackupRecordUpdate, BackupService, ClaimRequest, ControlPlane,
    ExtractedFileRegistration, FileRecord, FileUpdate, IngestReport, Md5Update, MetadataUpdate,
    PullQueueUpdate, QueueSnapshot, ServiceRegistration, TapeSettings, Task, TaskOutcome,
    VocabularyTables,
};
use archiver_worker::{CommandOutput, CommandRunner, CommandSpec, ServiceProbe};

/// [`MockControlPlane`] 的全部状态，字段公开以便测试直接断言
#[derive(Debug, Default)]
pub struct ControlPlaneState {
    // 预置数据
    pub pending_tasks: VecDeque<Task>,
    pub backup_services: HashMap<i64, BackupService>,
    pub files: HashMap<i64, FileRecord>,
    pub latest_files: HashMap<String, String>,
    pub heartbeat: HashMap<String, QueueSnapshot>,
    pub settings: TapeSettings,
    pub vocabulary: VocabularyTables,
    pub next_tar_record_id: i64,
    pub next_metadata_id: u64,
    pub fail_claims: bool,
    pub fail_tar_updates: bool,
    pub fail_metadata_updates: bool,
    /// 这些取回记录的状态更新返回错误
    pub fail_pull_entries: HashSet<i64>,

    // 调用记录
    pub claims: Vec<ClaimRequest>,
    pub completed: Vec<TaskOutcome>,
    pub requeued: Vec<Task>,
    pub task_statuses: Vec<(i64, i64)>,
    pub registrations: Vec<ServiceRegistration>,
    pub ended_services: Vec<String>,
    pub file_updates: Vec<(i64, FileUpdate)>,
    pub backup_updates: Vec<BackupRecordUpdate>,
    pub backup_batches: Vec<Vec<BackupRecordUpdate>>,
    pub tar_records: Vec<(i64, String)>,
    pub tar_updates: Vec<(i64, String)>,
    pub pull_updates: Vec<(i64, PullQueueUpdate)>,
    pub md5_updates: Vec<(i64, Md5Update)>,
    pub ingest_reports: Vec<(String, i64, IngestReport)>,
    pub retention_extensions: Vec<(String, i64)>,
    pub extracted_files: Vec<ExtractedFileRegistration>,
    pub metadata_updates: Vec<(String, MetadataUpdate)>,
    pub released_volumes: Vec<(String, String)>,
    /// `(resource, online)`
    pub resource_events: Vec<(String, bool)>,
}

/// 内存中的控制面
#[derive(Debug, Clone)]
pub struct MockControlPlane {
    state: Arc<Mutex<ControlPlaneState>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlPlaneState {
                next_tar_record_id: 1,
                next_metadata_id: 1,
                ..Default::default()
            })),
        }
    }

    pub fn with_backup_service(self, service: BackupService) -> Self {
        self.state()
            .backup_services
            .insert(service.backup_service_id, service);
        self
    }

    pub fn with_tasks(self, tasks: Vec<Task>) -> Self {
        self.state().pending_tasks.extend(tasks);
        self
    }

    pub fn with_file(self, file: FileRecord) -> Self {
        self.state().files.insert(file.file_id, file);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ControlPlaneState> {
        self.state.lock().unwrap()
    }

    /// 所有备份记录更新（单条和批量）按发生顺序展开
    pub fn all_backup_updates(&self) -> Vec<BackupRecordUpdate> {
        let state = self.state();
        let mut all = state.backup_updates.clone();
        all.extend(state.backup_batches.iter().flatten().cloned());
        all
    }

    /// 某个文件最后一次更新中的状态
    pub fn last_file_status(&self, file_id: i64) -> Option<i64> {
        self.state()
            .file_updates
            .iter()
            .rev()
            .filter(|(id, _)| *id == file_id)
            .find_map(|(_, update)| update.file_status_id)
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn claim_task(&self, request: &ClaimRequest) -> ArchiverResult<Option<Task>> {
        let mut state = self.state();
        state.claims.push(request.clone());
        if state.fail_claims {
            return Err(ArchiverError::control_plane("控制面不可用"));
        }
        Ok(state.pending_tasks.pop_front())
    }

    async fn report_task_complete(
        &self,
        outcome: &TaskOutcome,
        _division: &str,
    ) -> ArchiverResult<()> {
        self.state().completed.push(outcome.clone());
        Ok(())
    }

    async fn requeue_task(&self, task: &Task) -> ArchiverResult<()> {
        self.state().requeued.push(task.clone());
        Ok(())
    }

    async fn update_task_status(&self, task_id: i64, queue_status_id: i64) -> ArchiverResult<()> {
        self.state().task_statuses.push((task_id, queue_status_id));
        Ok(())
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> ArchiverResult<String> {
        let mut state = self.state();
        state.registrations.push(registration.clone());
        Ok(state.registrations.len().to_string())
    }

    async fn heartbeat(
        &self,
        _division: &str,
        _service_id: &str,
    ) -> ArchiverResult<HashMap<String, QueueSnapshot>> {
        Ok(self.state().heartbeat.clone())
    }

    async fn end_service(&self, service_id: &str) -> ArchiverResult<()> {
        self.state().ended_services.push(service_id.to_string());
        Ok(())
    }

    async fn tape_settings(&self) -> ArchiverResult<TapeSettings> {
        Ok(self.state().settings.clone())
    }

    async fn vocabulary(&self) -> ArchiverResult<VocabularyTables> {
        Ok(self.state().vocabulary.clone())
    }

    async fn backup_service(&self, backup_service_id: i64) -> ArchiverResult<Option<BackupService>> {
        Ok(self.state().backup_services.get(&backup_service_id).cloned())
    }

    async fn get_file(&self, file_id: i64) -> ArchiverResult<Option<FileRecord>> {
        Ok(self.state().files.get(&file_id).cloned())
    }

    async fn update_file(&self, file_id: i64, update: &FileUpdate) -> ArchiverResult<()> {
        let mut state = self.state();
        if let (Some(file), Some(status)) = (state.files.get_mut(&file_id), update.file_status_id) {
            file.file_status_id = status;
        }
        state.file_updates.push((file_id, update.clone()));
        Ok(())
    }

    async fn update_backup_record(&self, update: &BackupRecordUpdate) -> ArchiverResult<()> {
        self.state().backup_updates.push(update.clone());
        Ok(())
    }

    async fn update_backup_records(&self, updates: &[BackupRecordUpdate]) -> ArchiverResult<()> {
        self.state().backup_batches.push(updates.to_vec());
        Ok(())
    }

    async fn create_tar_record(&self, root_path: &str) -> ArchiverResult<i64> {
        let mut state = self.state();
        let id = state.next_tar_record_id;
        state.next_tar_record_id += 1;
        state.tar_records.push((id, root_path.to_string()));
        Ok(id)
    }

    async fn update_tar_record(&self, tar_record_id: i64, remote_path: &str) -> ArchiverResult<()> {
        let mut state = self.state();
        if state.fail_tar_updates {
            return Err(ArchiverError::control_plane("更新tar记录失败"));
        }
        state
            .tar_updates
            .push((tar_record_id, remote_path.to_string()));
        Ok(())
    }

    async fn update_pull_entry(
        &self,
        pull_queue_id: i64,
        update: &PullQueueUpdate,
    ) -> ArchiverResult<()> {
        let mut state = self.state();
        if state.fail_pull_entries.contains(&pull_queue_id) {
            return Err(ArchiverError::control_plane("更新取回记录失败"));
        }
        state.pull_updates.push((pull_queue_id, update.clone()));
        Ok(())
    }

    async fn update_md5_entry(&self, md5_queue_id: i64, update: &Md5Update) -> ArchiverResult<()> {
        self.state().md5_updates.push((md5_queue_id, update.clone()));
        Ok(())
    }

    async fn report_ingest(
        &self,
        callback: &str,
        file_ingest_id: i64,
        report: &IngestReport,
    ) -> ArchiverResult<()> {
        self.state()
            .ingest_reports
            .push((callback.to_string(), file_ingest_id, report.clone()));
        Ok(())
    }

    async fn extend_retention(&self, file: &str, days: i64) -> ArchiverResult<()> {
        self.state()
            .retention_extensions
            .push((file.to_string(), days));
        Ok(())
    }

    async fn latest_file(&self, file: &str) -> ArchiverResult<Option<String>> {
        Ok(self.state().latest_files.get(file).cloned())
    }

    async fn register_extracted_file(
        &self,
        registration: &ExtractedFileRegistration,
    ) -> ArchiverResult<String> {
        let mut state = self.state();
        let id = format!("meta-{}", state.next_metadata_id);
        state.next_metadata_id += 1;
        state.extracted_files.push(registration.clone());
        Ok(id)
    }

    async fn update_metadata(
        &self,
        metadata_id: &str,
        update: &MetadataUpdate,
    ) -> ArchiverResult<()> {
        let mut state = self.state();
        if state.fail_metadata_updates {
            return Err(ArchiverError::control_plane("更新元数据失败"));
        }
        state
            .metadata_updates
            .push((metadata_id.to_string(), update.clone()));
        Ok(())
    }

    async fn release_volume_lock(&self, division: &str, volume: &str) -> ArchiverResult<()> {
        self.state()
            .released_volumes
            .push((division.to_string(), volume.to_string()));
        Ok(())
    }

    async fn resource_online(&self, resource: &str, _service_id: &str) -> ArchiverResult<()> {
        self.state().resource_events.push((resource.to_string(), true));
        Ok(())
    }

    async fn resource_offline(&self, resource: &str, _service_id: &str) -> ArchiverResult<()> {
        self.state().resource_events.push((resource.to_string(), false));
        Ok(())
    }
}

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Responder = Box<dyn Fn(&CommandSpec) -> ArchiverResult<CommandOutput> + Send + Sync>;

struct Rule {
    program: String,
    matcher: Option<Matcher>,
    responder: Responder,
}

/// 脚本化的外部命令
///
/// 按注册顺序匹配第一条规则；没有匹配时返回退出码0和空输出。
/// 响应闭包可以顺带模拟命令的副作用（例如在磁盘上创建恢复出来的文件）。
#[derive(Clone, Default)]
pub struct MockCommandRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `program` 注册响应
    pub fn on<F>(self, program: &str, responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> ArchiverResult<CommandOutput> + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            matcher: None,
            responder: Box::new(responder),
        });
        self
    }

    /// 仅当 `matcher` 为真时生效的响应
    pub fn on_match<M, F>(self, program: &str, matcher: M, responder: F) -> Self
    where
        M: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        F: Fn(&CommandSpec) -> ArchiverResult<CommandOutput> + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            matcher: Some(Box::new(matcher)),
            responder: Box::new(responder),
        });
        self
    }

    /// 固定的标准输出，退出码0
    pub fn respond(self, program: &str, stdout: &'static str) -> Self {
        self.on(program, move |_| Ok(output(0, stdout, "")))
    }

    pub fn fail(self, program: &str, exit_code: i32, stderr: &'static str) -> Self {
        self.on(program, move |_| Ok(output(exit_code, "", stderr)))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.program == program)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> ArchiverResult<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let rules = self.rules.lock().unwrap();
        let rule = rules.iter().find(|rule| {
            rule.program == spec.program && rule.matcher.as_ref().map_or(true, |m| m(spec))
        });
        match rule {
            Some(rule) => (rule.responder)(spec),
            None => Ok(output(0, "", "")),
        }
    }
}

/// 固定结果的磁带探测，未设置的服务器视为在线
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    states: Arc<Mutex<HashMap<String, bool>>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server: &str, up: bool) {
        self.states.lock().unwrap().insert(server.to_string(), up);
    }

    pub fn with(self, server: &str, up: bool) -> Self {
        self.set(server, up);
        self
    }
}

#[async_trait]
impl ServiceProbe for StaticProbe {
    async fn is_up(&self, server: &str) -> bool {
        self.states.lock().unwrap().get(server).copied().unwrap_or(true)
    }
}
