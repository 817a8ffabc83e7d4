//! 各类任务的 `data` 负载
//!
//! 控制面把任务数据原样放进 `Task::data`，处理器在执行前反序列化为这里的强类型结构。

use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use archiver_errors::{ArchiverError, ArchiverResult};

/// 从任务负载中解析出指定类型
pub fn parse_payload<T: serde::de::DeserializeOwned>(
    task_name: &str,
    data: serde_json::Value,
) -> ArchiverResult<T> {
    serde_json::from_value(data)
        .map_err(|e| ArchiverError::invalid_params(format!("解析{task_name}任务参数失败: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutRecord {
    pub backup_record_id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub file_name: String,
}

impl PutRecord {
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(&self.file_name)
    }
}

/// put任务：一条记录走单文件传输，多条记录打包成一个tar对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutRequest {
    pub service: i64,
    #[serde(default)]
    pub root_dir: Option<String>,
    pub records: Vec<PutRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyRequest {
    pub file_id: i64,
    pub origin_file_path: String,
    pub origin_file_name: String,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    /// 显式指定的远程来源名称
    #[serde(default)]
    pub source: Option<String>,
}

impl CopyRequest {
    pub fn origin(&self) -> PathBuf {
        PathBuf::from(&self.origin_file_path).join(&self.origin_file_name)
    }

    pub fn destination(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(&self.file_name)
    }
}

/// prep与pull共用的拉取队列记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRecord {
    pub pull_queue_id: i64,
    #[serde(default)]
    pub file_id: Option<i64>,
    pub service: i64,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub position_a: Option<i64>,
    #[serde(default)]
    pub position_b: Option<i64>,
    #[serde(default)]
    pub tar_record_id: Option<i64>,
    /// 所属tar对象在磁带上的路径
    #[serde(default)]
    pub remote_path: Option<String>,
    #[serde(default)]
    pub remote_file_path: String,
    #[serde(default)]
    pub remote_file_name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
}

impl PullRecord {
    /// 磁带上需要读取的对象：打包文件取tar对象路径，否则取文件本身
    pub fn tape_object(&self) -> String {
        match (&self.tar_record_id, &self.remote_path) {
            (Some(_), Some(remote_path)) => remote_path.clone(),
            _ => format!(
                "{}/{}",
                self.remote_file_path.trim_end_matches('/'),
                self.remote_file_name
            ),
        }
    }

    /// tar对象内的成员路径
    pub fn member_path(&self) -> String {
        if self.remote_file_path.ends_with(&self.remote_file_name) {
            self.remote_file_path.clone()
        } else if self.remote_file_path.is_empty() {
            self.remote_file_name.clone()
        } else {
            format!(
                "{}/{}",
                self.remote_file_path.trim_end_matches('/'),
                self.remote_file_name
            )
        }
    }

    pub fn destination(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(&self.file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Md5Request {
    pub md5_queue_id: i64,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractSpec {
    pub path: String,
    #[serde(default)]
    pub file_type: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// tar任务：把目录重新打包成一个临时tar并建立索引
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TarRequest {
    #[serde(rename = "_id")]
    pub metadata_id: String,
    pub file_id: i64,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub origin_file_path: Option<String>,
    #[serde(default)]
    pub origin_file_name: Option<String>,
    #[serde(default)]
    pub local_purge_days: Option<i64>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub extract: Vec<ExtractSpec>,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub validate_mode: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurgeRequest {
    pub file_id: i64,
    pub file_path: String,
    pub file_name: String,
    /// 控制面格式: `%Y-%m-%dT%H:%M:%S`
    pub modified_dt: NaiveDateTime,
}

impl PurgeRequest {
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(&self.file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteRequest {
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
}

/// general任务：删除一个文件或目录树
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoveRequest {
    pub file: String,
    pub task_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    #[serde(rename = "_file")]
    pub file: String,
    #[serde(rename = "_callback")]
    pub callback: String,
    pub file_ingest_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_record_tape_object() {
        let mut record = PullRecord {
            pull_queue_id: 1,
            file_id: Some(10),
            service: 1,
            volume: Some("AG1234".to_string()),
            position_a: Some(5),
            position_b: Some(7),
            tar_record_id: None,
            remote_path: None,
            remote_file_path: "/hpss/backup_2026/data".to_string(),
            remote_file_name: "reads.fastq.55".to_string(),
            file_path: "/restore/data".to_string(),
            file_name: "reads.fastq".to_string(),
        };
        assert_eq!(record.tape_object(), "/hpss/backup_2026/data/reads.fastq.55");
        assert_eq!(record.destination(), PathBuf::from("/restore/data/reads.fastq"));

        record.tar_record_id = Some(12);
        record.remote_path = Some("/hpss/backup_2026/000/012/12.tar".to_string());
        record.remote_file_path = ".".to_string();
        assert_eq!(record.tape_object(), "/hpss/backup_2026/000/012/12.tar");
        assert_eq!(record.member_path(), "./reads.fastq.55");
    }

    #[test]
    fn test_parse_payload_reports_task_name() {
        let err = parse_payload::<Md5Request>("md5", serde_json::json!({"file_path": 3}))
            .unwrap_err();
        assert!(err.to_string().contains("md5"));

        let purge: PurgeRequest = parse_payload(
            "purge",
            serde_json::json!({
                "file_id": 3, "file_path": "/d", "file_name": "f",
                "modified_dt": "2026-02-03T04:05:06"
            }),
        )
        .unwrap();
        assert_eq!(purge.local_path(), PathBuf::from("/d/f"));
    }
}
