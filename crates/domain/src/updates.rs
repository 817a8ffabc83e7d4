//! 处理器发往控制面的记录更新
//!
//! 所有可选字段在为 `None` 时不序列化，只更新明确给出的字段。

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_status_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_file_name: Option<String>,
    #[serde(rename = "next_status", skip_serializing_if = "Option::is_none")]
    pub next_status_id: Option<i64>,
}

impl FileUpdate {
    pub fn status(file_status_id: i64) -> Self {
        Self {
            file_status_id: Some(file_status_id),
            ..Default::default()
        }
    }

    pub fn size(file_size: u64) -> Self {
        Self {
            file_size: Some(file_size),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecordUpdate {
    pub backup_record_id: i64,
    pub backup_record_status_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file_path: Option<String>,
    /// `Some(None)` 序列化为 `null`，用于清除旧的tar关联
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar_record_id: Option<Option<i64>>,
}

impl BackupRecordUpdate {
    pub fn status(backup_record_id: i64, backup_record_status_id: i64) -> Self {
        Self {
            backup_record_id,
            backup_record_status_id,
            remote_file_name: None,
            remote_file_path: None,
            tar_record_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullQueueUpdate {
    pub queue_status_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_a: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_b: Option<i64>,
}

impl PullQueueUpdate {
    pub fn status(queue_status_id: i64) -> Self {
        Self {
            queue_status_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Md5Update {
    pub queue_status_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
}

/// 文件所有者/组：名称解析失败时回退为数字id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Principal {
    Name(String),
    Id(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestStats {
    pub file_path: String,
    pub file_name: String,
    pub file_owner: Principal,
    pub file_group: Principal,
    pub file_size: u64,
    pub file_permissions: String,
    pub file_date: NaiveDateTime,
    #[serde(rename = "_is_folder")]
    pub is_folder: bool,
    #[serde(rename = "_is_file")]
    pub is_file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub file_ingest_status_id: i64,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub stats: Option<IngestStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderIndexEntry {
    pub file_name: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataUpdate {
    pub folder_index: Vec<FolderIndexEntry>,
    pub current_location: String,
    pub file_size: u64,
}

/// tar任务中需要单独登记的成员文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedFileRegistration {
    pub file: String,
    pub file_type: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_mode: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_purge_days: Option<i64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_record_cleared_with_null() {
        let mut update = BackupRecordUpdate::status(9, 4);
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("tar_record_id").is_none());

        update.tar_record_id = Some(None);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["tar_record_id"], serde_json::Value::Null);
    }

    #[test]
    fn test_ingest_report_flattens_stats() {
        let report = IngestReport {
            file_ingest_status_id: 11,
            stats: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({"file_ingest_status_id": 11}));

        let report = IngestReport {
            file_ingest_status_id: 12,
            stats: Some(IngestStats {
                file_path: "/d".to_string(),
                file_name: "f".to_string(),
                file_owner: Principal::Name("jdoe".to_string()),
                file_group: Principal::Id(5001),
                file_size: 3,
                file_permissions: "0o100640".to_string(),
                file_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
                is_folder: false,
                is_file: true,
            }),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["file_owner"], "jdoe");
        assert_eq!(json["file_group"], 5001);
        assert_eq!(json["_is_file"], true);
    }
}
