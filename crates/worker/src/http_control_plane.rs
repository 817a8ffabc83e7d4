//! 基于HTTP的控制面客户端

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use archiver_domain::{
    ArchiverError, ArchiverResult, BackupRecordUpdate, BackupService, ClaimRequest, ControlPlane,
    ExtractedFileRegistration, FileRecord, FileUpdate, IngestReport, Md5Update, MetadataUpdate,
    PullQueueUpdate, QueueSnapshot, ServiceRegistration, TapeSettings, Task, TaskOutcome,
    VocabularyTables,
};

pub struct HttpControlPlane {
    base_url: String,
    token: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct ServiceIdResponse {
    service_id: Value,
}

#[derive(Debug, Deserialize)]
struct TarRecordResponse {
    tar_record_id: i64,
}

#[derive(Debug, Deserialize)]
struct MetadataIdResponse {
    metadata_id: String,
}

impl HttpControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> ArchiverResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ArchiverError::control_plane(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
            max_retries: 10,
            retry_delay: Duration::from_secs(5),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    fn is_retryable(status: StatusCode) -> bool {
        status.is_server_error()
    }

    /// 发送请求，5xx和连接错误按配置重试；空响应或 `null` 返回 `None`
    async fn execute(&self, request: RequestBuilder, what: &str) -> ArchiverResult<Option<Value>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let can_retry = attempt <= self.max_retries;
            // 带流式请求体的请求无法复制，只发送一次
            let Some(current) = request.try_clone() else {
                return self.finish(request.send().await, what).await;
            };

            match current.send().await {
                Ok(response) if Self::is_retryable(response.status()) && can_retry => {
                    warn!(what, status = %response.status(), attempt, "控制面返回服务端错误，稍后重试");
                }
                Err(e) if (e.is_connect() || e.is_timeout()) && can_retry => {
                    warn!(what, error = %e, attempt, "连接控制面失败，稍后重试");
                }
                result => return self.finish(result, what).await,
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn finish(
        &self,
        result: reqwest::Result<reqwest::Response>,
        what: &str,
    ) -> ArchiverResult<Option<Value>> {
        let response =
            result.map_err(|e| ArchiverError::control_plane(format!("{what}: 请求失败: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ArchiverError::control_plane(format!("{what}: 读取响应失败: {e}")))?;
        if !status.is_success() {
            return Err(ArchiverError::control_plane(format!(
                "{what}: HTTP {status} - {body}"
            )));
        }
        debug!(what, %status, "控制面请求完成");
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> ArchiverResult<Option<T>> {
        match self.execute(request, what).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> ArchiverResult<T> {
        self.call(request, what)
            .await?
            .ok_or_else(|| ArchiverError::control_plane(format!("{what}: 响应为空")))
    }

    async fn put(&self, path: &str, body: &impl serde::Serialize) -> ArchiverResult<()> {
        self.execute(self.request(Method::PUT, path).json(body), path)
            .await
            .map(|_| ())
    }

    async fn post(&self, path: &str, body: &impl serde::Serialize) -> ArchiverResult<()> {
        self.execute(self.request(Method::POST, path).json(body), path)
            .await
            .map(|_| ())
    }

    fn claim_body(previous: Option<&TaskOutcome>, request: &ClaimRequest) -> Value {
        json!({
            "features": request.features,
            "tasks": request.tasks,
            "service": request.service_id,
            "division": request.division,
            "previous_task_id": previous.map(|p| p.task_id.clone()),
            "returned": previous.map(|p| p.success),
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn claim_task(&self, request: &ClaimRequest) -> ArchiverResult<Option<Task>> {
        self.complete_and_claim(None, request).await
    }

    async fn report_task_complete(
        &self,
        outcome: &TaskOutcome,
        division: &str,
    ) -> ArchiverResult<()> {
        self.put(
            "api/tape/taskcomplete",
            &json!({"task_id": outcome.task_id, "returned": outcome.success, "division": division}),
        )
        .await
    }

    /// 一次请求同时结束上一个任务并领取下一个任务
    async fn complete_and_claim(
        &self,
        previous: Option<&TaskOutcome>,
        request: &ClaimRequest,
    ) -> ArchiverResult<Option<Task>> {
        let body = Self::claim_body(previous, request);
        self.call(
            self.request(Method::POST, "api/tape/nexttask").json(&body),
            "api/tape/nexttask",
        )
        .await
    }

    async fn requeue_task(&self, task: &Task) -> ArchiverResult<()> {
        self.put("api/tape/task", &json!({ "task": task })).await
    }

    async fn update_task_status(&self, task_id: i64, queue_status_id: i64) -> ArchiverResult<()> {
        self.put(
            &format!("api/tape/task/{task_id}"),
            &json!({ "queue_status_id": queue_status_id }),
        )
        .await
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> ArchiverResult<String> {
        let mut body = serde_json::to_value(registration)?;
        body["started_dt"] = json!("now()");
        let response: ServiceIdResponse = self
            .call_required(
                self.request(Method::POST, "api/tape/service").json(&body),
                "api/tape/service",
            )
            .await?;
        Ok(match response.service_id {
            Value::String(id) => id,
            other => other.to_string(),
        })
    }

    async fn heartbeat(
        &self,
        division: &str,
        service_id: &str,
    ) -> ArchiverResult<HashMap<String, QueueSnapshot>> {
        let path = format!("api/tape/heartbeat/{division}/{service_id}");
        Ok(self
            .call(self.request(Method::GET, &path), &path)
            .await?
            .unwrap_or_default())
    }

    async fn end_service(&self, service_id: &str) -> ArchiverResult<()> {
        self.put(
            &format!("api/tape/service/{service_id}"),
            &json!({ "ended_dt": "now()" }),
        )
        .await
    }

    async fn tape_settings(&self) -> ArchiverResult<TapeSettings> {
        let path = "api/core/settings/tape";
        Ok(self
            .call(self.request(Method::GET, path), path)
            .await?
            .unwrap_or_default())
    }

    async fn vocabulary(&self) -> ArchiverResult<VocabularyTables> {
        let path = "api/tape/cvs";
        self.call_required(self.request(Method::GET, path), path)
            .await
    }

    async fn backup_service(&self, backup_service_id: i64) -> ArchiverResult<Option<BackupService>> {
        let path = format!("api/tape/backupservice/{backup_service_id}");
        self.call(self.request(Method::GET, &path), &path).await
    }

    async fn get_file(&self, file_id: i64) -> ArchiverResult<Option<FileRecord>> {
        let path = format!("api/tape/file/{file_id}");
        self.call(self.request(Method::GET, &path), &path).await
    }

    async fn update_file(&self, file_id: i64, update: &FileUpdate) -> ArchiverResult<()> {
        self.put(&format!("api/tape/file/{file_id}"), update).await
    }

    async fn update_backup_record(&self, update: &BackupRecordUpdate) -> ArchiverResult<()> {
        self.put(
            &format!("api/tape/backuprecord/{}", update.backup_record_id),
            update,
        )
        .await
    }

    async fn update_backup_records(&self, updates: &[BackupRecordUpdate]) -> ArchiverResult<()> {
        self.put("api/tape/backuprecords", &json!({ "records": updates }))
            .await
    }

    async fn create_tar_record(&self, root_path: &str) -> ArchiverResult<i64> {
        let response: TarRecordResponse = self
            .call_required(
                self.request(Method::POST, "api/tape/tar")
                    .json(&json!({ "root_path": root_path })),
                "api/tape/tar",
            )
            .await?;
        Ok(response.tar_record_id)
    }

    async fn update_tar_record(&self, tar_record_id: i64, remote_path: &str) -> ArchiverResult<()> {
        self.put(
            &format!("api/tape/tar/{tar_record_id}"),
            &json!({ "remote_path": remote_path }),
        )
        .await
    }

    async fn update_pull_entry(
        &self,
        pull_queue_id: i64,
        update: &PullQueueUpdate,
    ) -> ArchiverResult<()> {
        self.put(&format!("api/tape/pull/{pull_queue_id}"), update)
            .await
    }

    async fn update_md5_entry(&self, md5_queue_id: i64, update: &Md5Update) -> ArchiverResult<()> {
        self.put(&format!("api/tape/md5/{md5_queue_id}"), update)
            .await
    }

    async fn report_ingest(
        &self,
        callback: &str,
        file_ingest_id: i64,
        report: &IngestReport,
    ) -> ArchiverResult<()> {
        self.post(&format!("api/tape/{callback}/{file_ingest_id}"), report)
            .await
    }

    async fn extend_retention(&self, file: &str, days: i64) -> ArchiverResult<()> {
        self.put("api/tape/savefile", &json!({ "file": file, "days": days }))
            .await
    }

    async fn latest_file(&self, file: &str) -> ArchiverResult<Option<String>> {
        let path = "api/tape/latestfile";
        let response: Option<MetadataIdResponse> = self
            .call(
                self.request(Method::GET, path).query(&[("file", file)]),
                path,
            )
            .await?;
        Ok(response.map(|r| r.metadata_id))
    }

    async fn register_extracted_file(
        &self,
        registration: &ExtractedFileRegistration,
    ) -> ArchiverResult<String> {
        let path = "api/metadata/file";
        let response: MetadataIdResponse = self
            .call_required(self.request(Method::POST, path).json(registration), path)
            .await?;
        Ok(response.metadata_id)
    }

    async fn update_metadata(
        &self,
        metadata_id: &str,
        update: &MetadataUpdate,
    ) -> ArchiverResult<()> {
        self.put("api/metadata/file", &json!({ "id": metadata_id, "data": update }))
            .await
    }

    async fn release_volume_lock(&self, division: &str, volume: &str) -> ArchiverResult<()> {
        self.put(
            &format!("api/tape/releaselockedvolume/{division}/{volume}"),
            &json!({}),
        )
        .await
    }

    async fn resource_online(&self, resource: &str, service_id: &str) -> ArchiverResult<()> {
        self.post(
            "api/tape/resourceonline",
            &json!({ "resource": resource, "service_id": service_id }),
        )
        .await
    }

    async fn resource_offline(&self, resource: &str, service_id: &str) -> ArchiverResult<()> {
        self.post(
            "api/tape/resourceoffline",
            &json!({ "resource": resource, "service_id": service_id, "globally": true }),
        )
        .await
    }
}
