use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 已被某个Worker领取的任务
///
/// 字段名与控制面的JSON格式保持一致（`task`、`features`、`service`、`created`）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "task")]
    pub task_name: String,
    pub data: serde_json::Value,
    #[serde(rename = "features", default)]
    pub required_features: Vec<String>,
    #[serde(rename = "service")]
    pub service_id: String,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub division: String,
    /// pull任务携带的记录条数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
}

/// 已注册的数据传输服务（Worker进程）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub service_id: String,
    pub host: Option<String>,
    pub thread_count: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ServiceInfo {
    pub fn new(service_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            service_id: service_id.into(),
            host: None,
            thread_count: None,
            started_at,
            last_heartbeat: None,
        }
    }

    /// 心跳是否已超过给定阈值
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => now - last >= threshold,
            None => false,
        }
    }
}

/// Worker进程启动时向控制面注册的信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRegistration {
    pub tasks: Vec<String>,
    pub hostname: String,
    pub available_threads: usize,
    pub seconds_to_run: u64,
    pub division: String,
}

/// 单个队列的状态快照
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub record_count: usize,
    #[serde(rename = "file_size")]
    pub total_bytes: u64,
    pub currently_running: usize,
}

/// 控制面管理的文件记录（只引用，不归本系统所有）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub file_id: i64,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    pub file_status_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub backup_record_id: i64,
    pub file_id: i64,
    pub service: i64,
    pub remote_file_name: Option<String>,
    pub remote_file_path: Option<String>,
    pub tar_record_id: Option<i64>,
    pub backup_record_status_id: i64,
}

/// 一个磁带对象中打包的多个小文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TarRecord {
    pub tar_record_id: i64,
    pub remote_path: Option<String>,
    pub root_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullQueueEntry {
    pub pull_queue_id: i64,
    pub file_id: i64,
    pub tar_record_id: Option<i64>,
    pub volume: Option<String>,
    pub position_a: Option<i64>,
    pub position_b: Option<i64>,
    pub queue_status_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Md5QueueEntry {
    pub md5_queue_id: i64,
    pub file_path: String,
    pub queue_status_id: i64,
    pub md5sum: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackupServiceType {
    /// 直接通过hsi会话写入磁带
    #[serde(rename = "HPSS")]
    Hpss,
    /// 写入本地投递目录，由Globus定时器搬运
    #[serde(rename = "globus")]
    Globus,
    #[serde(other)]
    Unsupported,
}

/// 备份目标（磁带服务器或Globus投递目录）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupService {
    #[serde(default)]
    pub backup_service_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: BackupServiceType,
    #[serde(default)]
    pub server: Option<String>,
    pub default_path: String,
}

impl BackupService {
    pub fn tape_resource(&self) -> String {
        format!("hsi_{}", self.backup_service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_task_wire_names() {
        let json = serde_json::json!({
            "task_id": "AbCd12341",
            "task": "put",
            "data": {"service": 1, "records": []},
            "features": ["hsi_1"],
            "service": "42",
            "created": "2026-01-02T03:04:05Z",
            "division": "jgi"
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.task_name, "put");
        assert_eq!(task.required_features, vec!["hsi_1".to_string()]);
        assert_eq!(task.service_id, "42");
        assert_eq!(task.records, None);
    }

    #[test]
    fn test_service_staleness() {
        let started = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut service = ServiceInfo::new("7", started);
        let threshold = chrono::Duration::seconds(600);
        assert!(!service.is_stale(started + chrono::Duration::hours(5), threshold));

        service.last_heartbeat = Some(started);
        assert!(!service.is_stale(started + chrono::Duration::seconds(599), threshold));
        assert!(service.is_stale(started + chrono::Duration::seconds(600), threshold));
    }

    #[test]
    fn test_backup_service_type_parsing() {
        let hpss: BackupService = serde_json::from_value(serde_json::json!({
            "backup_service_id": 1, "name": "archive", "type": "HPSS",
            "server": "archive.nersc.gov", "default_path": "/home/p/proj/backup"
        }))
        .unwrap();
        assert_eq!(hpss.service_type, BackupServiceType::Hpss);
        assert_eq!(hpss.tape_resource(), "hsi_1");

        let other: BackupService = serde_json::from_value(serde_json::json!({
            "name": "s3", "type": "s3", "default_path": "bucket"
        }))
        .unwrap();
        assert_eq!(other.service_type, BackupServiceType::Unsupported);
    }
}
