use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::{BackupService, FileRecord, QueueSnapshot, ServiceRegistration, Task};
use crate::settings::TapeSettings;
use crate::updates::{
    BackupRecordUpdate, ExtractedFileRegistration, FileUpdate, IngestReport, Md5Update,
    MetadataUpdate, PullQueueUpdate,
};
use crate::vocabulary::VocabularyTables;
use archiver_errors::ArchiverResult;

/// 领取任务的请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimRequest {
    pub features: Vec<String>,
    pub tasks: Vec<String>,
    #[serde(rename = "service")]
    pub service_id: String,
    pub division: String,
}

/// 上一个任务的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    #[serde(rename = "returned")]
    pub success: bool,
}

/// 控制面客户端
///
/// 控制面持有所有记录的持久状态，是Worker之间唯一的协调点。
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // ---- 任务 ----

    async fn claim_task(&self, request: &ClaimRequest) -> ArchiverResult<Option<Task>>;

    async fn report_task_complete(&self, outcome: &TaskOutcome, division: &str)
        -> ArchiverResult<()>;

    /// 先结束上一个任务再领取下一个任务
    ///
    /// 默认实现是两次独立调用；传输层可以把它们合并成一次请求。
    async fn complete_and_claim(
        &self,
        previous: Option<&TaskOutcome>,
        request: &ClaimRequest,
    ) -> ArchiverResult<Option<Task>> {
        if let Some(outcome) = previous {
            self.report_task_complete(outcome, &request.division).await?;
        }
        self.claim_task(request).await
    }

    /// 把任务交还给控制面重新排队
    async fn requeue_task(&self, task: &Task) -> ArchiverResult<()>;

    async fn update_task_status(&self, task_id: i64, queue_status_id: i64) -> ArchiverResult<()>;

    // ---- 服务 ----

    async fn register_service(&self, registration: &ServiceRegistration) -> ArchiverResult<String>;

    async fn heartbeat(
        &self,
        division: &str,
        service_id: &str,
    ) -> ArchiverResult<HashMap<String, QueueSnapshot>>;

    async fn end_service(&self, service_id: &str) -> ArchiverResult<()>;

    // ---- 配置 ----

    async fn tape_settings(&self) -> ArchiverResult<TapeSettings>;

    async fn vocabulary(&self) -> ArchiverResult<VocabularyTables>;

    async fn backup_service(&self, backup_service_id: i64) -> ArchiverResult<Option<BackupService>>;

    // ---- 记录 ----

    async fn get_file(&self, file_id: i64) -> ArchiverResult<Option<FileRecord>>;

    async fn update_file(&self, file_id: i64, update: &FileUpdate) -> ArchiverResult<()>;

    async fn update_backup_record(&self, update: &BackupRecordUpdate) -> ArchiverResult<()>;

    async fn update_backup_records(&self, updates: &[BackupRecordUpdate]) -> ArchiverResult<()>;

    async fn create_tar_record(&self, root_path: &str) -> ArchiverResult<i64>;

    async fn update_tar_record(&self, tar_record_id: i64, remote_path: &str) -> ArchiverResult<()>;

    async fn update_pull_entry(
        &self,
        pull_queue_id: i64,
        update: &PullQueueUpdate,
    ) -> ArchiverResult<()>;

    async fn update_md5_entry(&self, md5_queue_id: i64, update: &Md5Update) -> ArchiverResult<()>;

    async fn report_ingest(
        &self,
        callback: &str,
        file_ingest_id: i64,
        report: &IngestReport,
    ) -> ArchiverResult<()>;

    // ---- 保留期与元数据 ----

    /// 延长本地文件的保留期
    async fn extend_retention(&self, file: &str, days: i64) -> ArchiverResult<()>;

    /// 按本地路径查找最近登记的文件，返回其元数据id
    async fn latest_file(&self, file: &str) -> ArchiverResult<Option<String>>;

    async fn register_extracted_file(
        &self,
        registration: &ExtractedFileRegistration,
    ) -> ArchiverResult<String>;

    async fn update_metadata(&self, metadata_id: &str, update: &MetadataUpdate)
        -> ArchiverResult<()>;

    // ---- 资源 ----

    async fn release_volume_lock(&self, division: &str, volume: &str) -> ArchiverResult<()>;

    async fn resource_online(&self, resource: &str, service_id: &str) -> ArchiverResult<()>;

    async fn resource_offline(&self, resource: &str, service_id: &str) -> ArchiverResult<()>;
}
