use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use archiver_domain::{
    parse_payload, ArchiverError, ArchiverResult, BackupRecordStatus, BackupRecordUpdate,
    BackupService, BackupServiceType, FileStatus, PutRecord, PutRequest, Task,
};

use super::{
    blocking, copy_preserving, file_name_of, is_under, parent_of, path_string, split_remote,
    HandlerContext, TaskHandler,
};
use crate::paths::{
    bundle_object_name, current_year, member_name, sharded_path, single_file_remote_path,
};
use crate::staging::StagingDir;

/// 写入备份目标：磁带（hsi/htar）或Globus投递目录
pub struct PutHandler;

/// 写入目的地
enum Destination<'a> {
    /// 通过hsi/htar直接写入磁带服务器
    Tape(&'a str),
    /// 复制到Globus投递目录，先写 `temp_path` 再改名进入 `source_path`
    Drop {
        source_path: PathBuf,
        temp_path: PathBuf,
    },
}

#[async_trait]
impl TaskHandler for PutHandler {
    fn name(&self) -> &'static str {
        "put"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: PutRequest = parse_payload(self.name(), task.data.clone())?;
        if request.records.is_empty() {
            return Ok(true);
        }
        let service = ctx.backup_service(request.service).await?;

        let destination = match service.service_type {
            BackupServiceType::Hpss => {
                let server = ctx.tape_server(&service)?;
                if !ctx.probe.is_up(server).await {
                    return Err(ArchiverError::resource_unavailable(service.tape_resource()));
                }
                Destination::Tape(server)
            }
            BackupServiceType::Globus => {
                let (source_path, temp_path) = ctx.settings.backup_service_paths(&service.name)?;
                Destination::Drop {
                    source_path,
                    temp_path,
                }
            }
            BackupServiceType::Unsupported => {
                warn!(service = %service.name, "不支持的备份服务类型");
                for record in &request.records {
                    mark_failed(ctx, record).await?;
                }
                return Ok(false);
            }
        };

        let mut settled = HashSet::new();
        let result = match (&destination, request.records.as_slice()) {
            (Destination::Tape(server), [record]) => {
                put_single_hsi(ctx, &service, server, record, &mut settled).await
            }
            (Destination::Tape(server), _) => {
                put_bundle_hsi(ctx, &service, server, &request, &mut settled).await
            }
            (
                Destination::Drop {
                    source_path,
                    temp_path,
                },
                [record],
            ) => put_single_globus(ctx, &service, source_path, temp_path, record, &mut settled).await,
            (
                Destination::Drop {
                    source_path,
                    temp_path,
                },
                _,
            ) => {
                put_bundle_globus(ctx, &service, source_path, temp_path, &request, &mut settled)
                    .await
            }
        };
        fail_unsettled(ctx, &request.records, &settled, result).await
    }
}

/// 出错时把还没有最终状态的记录标记为TRANSFER_FAILED，再返回原来的错误
async fn fail_unsettled(
    ctx: &HandlerContext,
    records: &[PutRecord],
    settled: &HashSet<i64>,
    result: ArchiverResult<bool>,
) -> ArchiverResult<bool> {
    let e = match result {
        Ok(done) => return Ok(done),
        Err(e) => e,
    };
    let pending: Vec<i64> = records
        .iter()
        .map(|r| r.backup_record_id)
        .filter(|id| !settled.contains(id))
        .collect();
    if !pending.is_empty() {
        warn!(records = ?pending, error = %e, "写入过程出错");
        if let Err(update_err) = mark_all_failed(ctx, &pending).await {
            warn!(records = ?pending, error = %update_err, "更新备份记录状态失败");
        }
    }
    Err(e)
}

async fn mark_failed(ctx: &HandlerContext, record: &PutRecord) -> ArchiverResult<()> {
    warn!(backup_record_id = record.backup_record_id, "备份记录标记为TRANSFER_FAILED");
    let failed = ctx
        .vocabulary
        .backup_record_status(BackupRecordStatus::TransferFailed);
    ctx.control_plane
        .update_backup_record(&BackupRecordUpdate::status(record.backup_record_id, failed))
        .await
}

async fn mark_all_failed(ctx: &HandlerContext, backup_record_ids: &[i64]) -> ArchiverResult<()> {
    if backup_record_ids.is_empty() {
        return Ok(());
    }
    warn!(records = ?backup_record_ids, "整包备份记录标记为TRANSFER_FAILED");
    let failed = ctx
        .vocabulary
        .backup_record_status(BackupRecordStatus::TransferFailed);
    let updates: Vec<BackupRecordUpdate> = backup_record_ids
        .iter()
        .map(|id| BackupRecordUpdate::status(*id, failed))
        .collect();
    ctx.control_plane.update_backup_records(&updates).await
}

fn completed_update(
    ctx: &HandlerContext,
    backup_record_id: i64,
    remote_file_name: String,
    remote_file_path: String,
    tar_record_id: Option<i64>,
) -> BackupRecordUpdate {
    BackupRecordUpdate {
        backup_record_id,
        backup_record_status_id: ctx
            .vocabulary
            .backup_record_status(BackupRecordStatus::TransferComplete),
        remote_file_name: Some(remote_file_name),
        remote_file_path: Some(remote_file_path),
        tar_record_id: Some(tar_record_id),
    }
}

/// 临时目录中的文件已经有备份时只保留一天，由purge任务清理
async fn extend_temp_retention(
    ctx: &HandlerContext,
    record: &PutRecord,
    local: &Path,
) -> ArchiverResult<()> {
    if !is_under(local, ctx.temp_dir()) {
        return Ok(());
    }
    let backed_up = ctx.vocabulary.file_status(FileStatus::BackupComplete);
    if let Some(file) = ctx.control_plane.get_file(record.file_id).await? {
        if file.file_status_id == backed_up {
            ctx.control_plane
                .extend_retention(&path_string(local), 1)
                .await?;
        }
    }
    Ok(())
}

async fn put_single_hsi(
    ctx: &HandlerContext,
    service: &BackupService,
    server: &str,
    record: &PutRecord,
    settled: &mut HashSet<i64>,
) -> ArchiverResult<bool> {
    let local = record.local_path();
    let size = match std::fs::metadata(&local) {
        Ok(metadata) => metadata.len(),
        Err(_) => {
            warn!(file = %local.display(), "源文件已不存在");
            mark_failed(ctx, record).await?;
            settled.insert(record.backup_record_id);
            return Ok(false);
        }
    };

    let remote = single_file_remote_path(
        &service.default_path,
        current_year(),
        &local,
        record.backup_record_id,
    );
    let transfer = async {
        let staging =
            StagingDir::create(ctx.temp_dir(), &format!("{}_put", record.backup_record_id))?;
        let link = staging.link(&local, &file_name_of(&local))?;
        if !ctx.debug {
            let hsi = ctx.hsi();
            hsi.put(server, &link, &remote).await?;
            hsi.verify(server, &remote, size, true).await?;
        }
        Ok::<_, ArchiverError>(())
    };

    if let Err(e) = transfer.await {
        warn!(backup_record_id = record.backup_record_id, error = %e, "hsi写入单个文件失败");
        mark_failed(ctx, record).await?;
        settled.insert(record.backup_record_id);
        return Ok(false);
    }

    let (remote_file_path, remote_file_name) = split_remote(&remote);
    ctx.control_plane
        .update_backup_record(&completed_update(
            ctx,
            record.backup_record_id,
            remote_file_name,
            remote_file_path,
            None,
        ))
        .await?;
    settled.insert(record.backup_record_id);
    info!(backup_record_id = record.backup_record_id, remote = %remote, "单个文件已写入磁带");
    extend_temp_retention(ctx, record, &local).await?;
    Ok(true)
}

/// 检查整包成员是否存在，缺失的单独标记失败
async fn present_members<'a>(
    ctx: &HandlerContext,
    request: &'a PutRequest,
    settled: &mut HashSet<i64>,
) -> ArchiverResult<Vec<(&'a PutRecord, PathBuf, u64)>> {
    let mut present = Vec::with_capacity(request.records.len());
    for record in &request.records {
        let local = record.local_path();
        match std::fs::metadata(&local) {
            Ok(metadata) => present.push((record, local, metadata.len())),
            Err(_) => {
                warn!(file = %local.display(), "源文件已不存在");
                mark_failed(ctx, record).await?;
                settled.insert(record.backup_record_id);
            }
        }
    }
    Ok(present)
}

async fn put_bundle_hsi(
    ctx: &HandlerContext,
    service: &BackupService,
    server: &str,
    request: &PutRequest,
    settled: &mut HashSet<i64>,
) -> ArchiverResult<bool> {
    let present = present_members(ctx, request, settled).await?;
    if present.is_empty() {
        return Ok(false);
    }

    let root_dir = request.root_dir.clone().unwrap_or_default();
    let tar_record_id = ctx.control_plane.create_tar_record(&root_dir).await?;
    let staging = StagingDir::create(ctx.temp_dir(), &format!("{tar_record_id}_tar"))?;

    let mut completed = Vec::new();
    let mut total_size = 0u64;
    for (record, local, size) in present {
        let name = member_name(&record.file_name, record.backup_record_id);
        if let Err(e) = staging.link(&local, &name) {
            warn!(file = %local.display(), error = %e, "建立暂存链接失败");
            mark_failed(ctx, record).await?;
            settled.insert(record.backup_record_id);
            continue;
        }
        total_size += size;
        completed.push(completed_update(
            ctx,
            record.backup_record_id,
            name,
            ".".to_string(),
            Some(tar_record_id),
        ));
    }
    if completed.is_empty() {
        return Ok(false);
    }

    let tar_location = format!(
        "{}/{}",
        sharded_path(&service.default_path, current_year()),
        bundle_object_name(tar_record_id)
    );
    ctx.control_plane
        .update_tar_record(tar_record_id, &tar_location)
        .await?;

    let transfer = async {
        if !ctx.debug {
            let hsi = ctx.hsi();
            hsi.htar_create(server, staging.path(), &tar_location).await?;
            // htar会追加索引数据，只能校验不小于成员大小之和
            hsi.verify(server, &tar_location, total_size, false).await?;
        }
        Ok::<_, ArchiverError>(())
    };
    let result = transfer.await;
    drop(staging);

    let ids: Vec<i64> = completed.iter().map(|u| u.backup_record_id).collect();
    match result {
        Ok(()) => {
            ctx.control_plane.update_backup_records(&completed).await?;
            settled.extend(ids);
            info!(
                tar_record_id,
                files = completed.len(),
                tar_location = %tar_location,
                "整包已写入磁带"
            );
            Ok(true)
        }
        Err(e) => {
            warn!(tar_record_id, error = %e, "htar写入整包失败");
            mark_all_failed(ctx, &ids).await?;
            settled.extend(ids);
            Ok(false)
        }
    }
}

async fn put_single_globus(
    ctx: &HandlerContext,
    service: &BackupService,
    source_path: &Path,
    temp_path: &Path,
    record: &PutRecord,
    settled: &mut HashSet<i64>,
) -> ArchiverResult<bool> {
    let local = record.local_path();
    if !local.exists() {
        warn!(file = %local.display(), "源文件已不存在");
        mark_failed(ctx, record).await?;
        settled.insert(record.backup_record_id);
        return Ok(false);
    }

    let remote_file_path = format!(
        "{}/{}",
        current_year(),
        record.file_path.trim_start_matches('/')
    );
    let remote_file_name = format!("{}.{}", record.file_name, record.backup_record_id);
    let target_dir = source_path.join(&remote_file_path);
    let temp_file = temp_path.join(&remote_file_name);
    let target = target_dir.join(&remote_file_name);

    let copy_result = {
        let (local, temp_file) = (local.clone(), temp_file.clone());
        blocking(move || {
            std::fs::create_dir_all(&target_dir)?;
            copy_preserving(&local, &temp_file)?;
            std::fs::rename(&temp_file, &target)?;
            Ok(())
        })
        .await
    };
    if let Err(e) = copy_result {
        warn!(backup_record_id = record.backup_record_id, error = %e, "写入Globus投递目录失败");
        if temp_file.exists() {
            let _ = std::fs::remove_file(&temp_file);
        }
        mark_failed(ctx, record).await?;
        settled.insert(record.backup_record_id);
        return Ok(false);
    }

    ctx.control_plane
        .update_backup_record(&completed_update(
            ctx,
            record.backup_record_id,
            remote_file_name,
            format!(
                "{}/{}",
                service.default_path.trim_end_matches('/'),
                remote_file_path
            ),
            None,
        ))
        .await?;
    settled.insert(record.backup_record_id);
    extend_temp_retention(ctx, record, &local).await?;
    Ok(true)
}

async fn put_bundle_globus(
    ctx: &HandlerContext,
    service: &BackupService,
    source_path: &Path,
    temp_path: &Path,
    request: &PutRequest,
    settled: &mut HashSet<i64>,
) -> ArchiverResult<bool> {
    let present = present_members(ctx, request, settled).await?;
    if present.is_empty() {
        return Ok(false);
    }

    let root_dir = request.root_dir.clone().unwrap_or_default();
    let tar_record_id = ctx.control_plane.create_tar_record(&root_dir).await?;
    let tar_location = format!("{}/{}", current_year(), bundle_object_name(tar_record_id));
    let target = source_path.join(&tar_location);
    let temp_file = temp_path.join(file_name_of(&target));

    let mut members: Vec<(PathBuf, String)> = Vec::with_capacity(present.len());
    let mut completed = Vec::with_capacity(present.len());
    for (record, local, _) in present {
        let name = member_name(&record.file_name, record.backup_record_id);
        members.push((local, name.clone()));
        completed.push(completed_update(
            ctx,
            record.backup_record_id,
            name,
            ".".to_string(),
            Some(tar_record_id),
        ));
    }
    let ids: Vec<i64> = completed.iter().map(|u| u.backup_record_id).collect();

    let build_result = {
        let (target, temp_file) = (target.clone(), temp_file.clone());
        blocking(move || {
            std::fs::create_dir_all(parent_of(&target))?;
            let mut builder = ::tar::Builder::new(File::create(&temp_file)?);
            for (local, name) in &members {
                builder.append_path_with_name(local, name)?;
            }
            builder.into_inner()?;
            std::fs::rename(&temp_file, &target)?;
            Ok(())
        })
        .await
    };
    if let Err(e) = build_result {
        warn!(tar_record_id, error = %e, "生成Globus整包失败");
        if temp_file.exists() {
            let _ = std::fs::remove_file(&temp_file);
        }
        mark_all_failed(ctx, &ids).await?;
        settled.extend(ids);
        return Ok(false);
    }

    ctx.control_plane
        .update_tar_record(
            tar_record_id,
            &format!(
                "{}/{}",
                service.default_path.trim_end_matches('/'),
                tar_location
            ),
        )
        .await?;
    ctx.control_plane.update_backup_records(&completed).await?;
    settled.extend(ids);
    info!(tar_record_id, files = completed.len(), "整包已写入Globus投递目录");
    Ok(true)
}
