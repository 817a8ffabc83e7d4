use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{Gid, Group, Uid, User};
use tracing::{info, warn};

use archiver_domain::{
    parse_payload, ArchiverResult, FileStatus, IngestReport, IngestRequest, IngestStats,
    Principal, Task,
};

use super::{file_name_of, parent_of, path_string, HandlerContext, TaskHandler};

/// 收集待登记文件的元数据并回调控制面
pub struct IngestHandler;

fn owner_of(uid: u32) -> Principal {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Principal::Name(user.name),
        _ => Principal::Id(uid),
    }
}

fn group_of(gid: u32) -> Principal {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => Principal::Name(group.name),
        _ => Principal::Id(gid),
    }
}

pub fn collect_stats(path: &Path) -> ArchiverResult<IngestStats> {
    let metadata = std::fs::metadata(path)?;
    let modified = chrono::DateTime::<chrono::Local>::from(metadata.modified()?);
    Ok(IngestStats {
        file_path: path_string(&parent_of(path)),
        file_name: file_name_of(path),
        file_owner: owner_of(metadata.uid()),
        file_group: group_of(metadata.gid()),
        file_size: metadata.len(),
        file_permissions: format!("0o{:o}", metadata.mode()),
        file_date: modified.naive_local(),
        is_folder: metadata.is_dir(),
        is_file: metadata.is_file(),
    })
}

#[async_trait]
impl TaskHandler for IngestHandler {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: IngestRequest = parse_payload(self.name(), task.data.clone())?;
        let cv = &ctx.vocabulary;

        let Ok(resolved) = std::fs::canonicalize(&request.file) else {
            info!(file = %request.file, "文件不存在或没有访问权限");
            ctx.control_plane
                .report_ingest(
                    &request.callback,
                    request.file_ingest_id,
                    &IngestReport {
                        file_ingest_status_id: cv.file_status(FileStatus::IngestFileMissing),
                        stats: None,
                    },
                )
                .await?;
            return Ok(false);
        };

        let reported = match collect_stats(&resolved) {
            Ok(stats) => {
                ctx.control_plane
                    .report_ingest(
                        &request.callback,
                        request.file_ingest_id,
                        &IngestReport {
                            file_ingest_status_id: cv
                                .file_status(FileStatus::IngestStatsComplete),
                            stats: Some(stats),
                        },
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match reported {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(file = %resolved.display(), error = %e, "获取文件信息失败");
                ctx.control_plane
                    .report_ingest(
                        &request.callback,
                        request.file_ingest_id,
                        &IngestReport {
                            file_ingest_status_id: cv.file_status(FileStatus::IngestStatsFailed),
                            stats: None,
                        },
                    )
                    .await?;
                Ok(false)
            }
        }
    }
}
