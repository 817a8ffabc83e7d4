//! 受控词表
//!
//! 文件状态、备份记录状态和队列状态都是封闭的小整数枚举，启动时从控制面加载一次，
//! 之后所有状态转换都按名称引用。加载时校验词表必须覆盖本系统用到的全部名称，
//! 因此运行期的查找不会失败。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use archiver_errors::{ArchiverError, ArchiverResult};

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn index(&self) -> usize {
                *self as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary!(
    /// 文件状态
    FileStatus {
        Registered => "REGISTERED",
        CopyReady => "COPY_READY",
        CopyComplete => "COPY_COMPLETE",
        CopyFailed => "COPY_FAILED",
        BackupReady => "BACKUP_READY",
        BackupComplete => "BACKUP_COMPLETE",
        TarComplete => "TAR_COMPLETE",
        Purged => "PURGED",
        RestoreInProgress => "RESTORE_IN_PROGRESS",
        Restored => "RESTORED",
        IngestStatsComplete => "INGEST_STATS_COMPLETE",
        IngestStatsFailed => "INGEST_STATS_FAILED",
        IngestFileMissing => "INGEST_FILE_MISSING",
    }
);

vocabulary!(
    /// 备份记录状态
    BackupRecordStatus {
        Registered => "REGISTERED",
        TransferReady => "TRANSFER_READY",
        TransferInProgress => "TRANSFER_IN_PROGRESS",
        TransferComplete => "TRANSFER_COMPLETE",
        TransferFailed => "TRANSFER_FAILED",
    }
);

vocabulary!(
    /// pull/md5/通用任务队列状态
    QueueStatus {
        Registered => "REGISTERED",
        InProgress => "IN_PROGRESS",
        Complete => "COMPLETE",
        Failed => "FAILED",
        PrepFailed => "PREP_FAILED",
    }
);

/// 控制面返回的原始词表：名称 -> id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VocabularyTables {
    pub file_status: HashMap<String, i64>,
    pub backup_record_status: HashMap<String, i64>,
    pub queue_status: HashMap<String, i64>,
}

/// 已校验的受控词表，构造后通过 `Arc` 共享给所有处理器
#[derive(Debug, Clone, PartialEq)]
pub struct ControlledVocabulary {
    file_status: Vec<i64>,
    backup_record_status: Vec<i64>,
    queue_status: Vec<i64>,
}

fn resolve<T: Copy + std::fmt::Display>(
    table_name: &str,
    table: &HashMap<String, i64>,
    names: &[T],
) -> ArchiverResult<Vec<i64>> {
    names
        .iter()
        .map(|status| {
            table.get(&status.to_string()).copied().ok_or_else(|| {
                ArchiverError::config_error(format!("受控词表 {table_name} 缺少 {status}"))
            })
        })
        .collect()
}

impl ControlledVocabulary {
    pub fn from_tables(tables: &VocabularyTables) -> ArchiverResult<Self> {
        Ok(Self {
            file_status: resolve("file_status", &tables.file_status, FileStatus::ALL)?,
            backup_record_status: resolve(
                "backup_record_status",
                &tables.backup_record_status,
                BackupRecordStatus::ALL,
            )?,
            queue_status: resolve("queue_status", &tables.queue_status, QueueStatus::ALL)?,
        })
    }

    pub fn file_status(&self, status: FileStatus) -> i64 {
        self.file_status[status.index()]
    }

    pub fn backup_record_status(&self, status: BackupRecordStatus) -> i64 {
        self.backup_record_status[status.index()]
    }

    pub fn queue_status(&self, status: QueueStatus) -> i64 {
        self.queue_status[status.index()]
    }

    /// 按声明顺序从1开始编号的词表，供测试和离线调试使用
    pub fn sequential() -> Self {
        fn numbered(len: usize) -> Vec<i64> {
            (1..=len as i64).collect()
        }
        Self {
            file_status: numbered(FileStatus::ALL.len()),
            backup_record_status: numbered(BackupRecordStatus::ALL.len()),
            queue_status: numbered(QueueStatus::ALL.len()),
        }
    }
}
