use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use archiver_errors::{ArchiverError, ArchiverResult};

pub const SECONDS_IN_DAY: i64 = 60 * 60 * 24;

fn default_purge_days() -> i64 {
    10
}

/// 通过rsync访问的远程挂载来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSource {
    pub rsync_uri: String,
    pub rsync_password: String,
    #[serde(default)]
    pub path_prefix_source: Option<String>,
    #[serde(default)]
    pub path_prefix_destination: String,
    pub path_temp: PathBuf,
}

/// Globus投递目录
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupServicePaths {
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub temp_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DivisionSettings {
    pub name: String,
    #[serde(default)]
    pub tape_temp_dir: Option<PathBuf>,
}

/// 控制面下发的站点级磁带配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TapeSettings {
    #[serde(default)]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub division: Vec<DivisionSettings>,
    #[serde(rename = "purge_file_accessed", default = "default_purge_days")]
    pub purge_file_accessed_days: i64,
    #[serde(rename = "purge_file_extend", default = "default_purge_days")]
    pub purge_file_extend_days: i64,
    #[serde(default)]
    pub remote_sources: HashMap<String, RemoteSource>,
    #[serde(default)]
    pub backup_services: HashMap<String, BackupServicePaths>,
}

impl Default for TapeSettings {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::new(),
            division: Vec::new(),
            purge_file_accessed_days: default_purge_days(),
            purge_file_extend_days: default_purge_days(),
            remote_sources: HashMap::new(),
            backup_services: HashMap::new(),
        }
    }
}

impl TapeSettings {
    /// 选定分区的临时目录：分区配置优先，否则使用 `fallback`
    pub fn for_division(mut self, division: &str, fallback: &Path) -> Self {
        let configured = self
            .division
            .iter()
            .find(|d| d.name == division)
            .and_then(|d| d.tape_temp_dir.clone());
        self.temp_dir = configured.unwrap_or_else(|| {
            if self.temp_dir.as_os_str().is_empty() {
                fallback.to_path_buf()
            } else {
                self.temp_dir.clone()
            }
        });
        self
    }

    pub fn purge_accessed_seconds(&self) -> i64 {
        self.purge_file_accessed_days * SECONDS_IN_DAY
    }

    /// 查找远程来源：记录显式给出 `source` 时直接使用，否则按路径前缀匹配
    pub fn remote_source(&self, source: Option<&str>, file_path: &str) -> Option<&RemoteSource> {
        if let Some(source) = source {
            return self.remote_sources.get(source);
        }
        self.remote_sources.values().find(|remote| {
            remote
                .path_prefix_source
                .as_deref()
                .is_some_and(|prefix| file_path.starts_with(prefix))
        })
    }

    /// Globus服务的投递路径和临时路径
    pub fn backup_service_paths(&self, name: &str) -> ArchiverResult<(PathBuf, PathBuf)> {
        let paths = self.backup_services.get(name).ok_or_else(|| {
            ArchiverError::service_config(format!("未找到备份服务 {name} 的配置"))
        })?;
        let source = paths.source_path.clone().ok_or_else(|| {
            ArchiverError::service_config(format!("备份服务 {name} 缺少 `source_path`"))
        })?;
        let temp = paths.temp_path.clone().ok_or_else(|| {
            ArchiverError::service_config(format!("备份服务 {name} 缺少 `temp_path`"))
        })?;
        Ok((source, temp))
    }
}
