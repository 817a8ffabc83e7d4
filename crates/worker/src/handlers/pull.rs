//! 磁带读取：`prep` 批量定位卷号和位置，`pull` 按卷批量取回

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{error, info, warn};

use archiver_domain::{
    parse_payload, ArchiverError, ArchiverResult, PullQueueUpdate, PullRecord, QueueStatus, Task,
};

use super::{blocking, copy_preserving, create_dir_with_mode, HandlerContext, TaskHandler, DIR_MODE};
use crate::command::CommandSpec;
use crate::hsi::{HsiLocateSession, SessionQueue, RETRIEVAL_TIMEOUT};
use crate::paths::hidden_temp_path;
use crate::staging::StagingDir;

pub const TAR_PROGRAM: &str = "tar";

async fn set_pull_status(
    ctx: &HandlerContext,
    pull_queue_ids: impl IntoIterator<Item = i64>,
    status: QueueStatus,
) -> ArchiverResult<()> {
    let update = PullQueueUpdate::status(ctx.vocabulary.queue_status(status));
    for pull_queue_id in pull_queue_ids {
        ctx.control_plane
            .update_pull_entry(pull_queue_id, &update)
            .await?;
    }
    Ok(())
}

/// 批量查询待取回文件所在的卷和位置
pub struct PrepHandler;

#[async_trait]
impl TaskHandler for PrepHandler {
    fn name(&self) -> &'static str {
        "prep"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let records: Vec<PullRecord> = parse_payload(self.name(), task.data.clone())?;
        let mut by_service: BTreeMap<i64, Vec<PullRecord>> = BTreeMap::new();
        for record in records {
            by_service.entry(record.service).or_default().push(record);
        }

        let mut success = true;
        for (service_id, records) in by_service {
            let service = ctx.backup_service(service_id).await?;
            let server = ctx.tape_server(&service)?;
            let ids: Vec<i64> = records.iter().map(|r| r.pull_queue_id).collect();
            if !ctx.probe.is_up(server).await {
                warn!(server, records = records.len(), "磁带服务不可用，记录重新排队");
                set_pull_status(ctx, ids, QueueStatus::Registered).await?;
                success = false;
                continue;
            }

            let mut queue = SessionQueue::new(HsiLocateSession::new(ctx.hsi(), server));
            for record in &records {
                queue.queue(record.tape_object(), record.pull_queue_id);
            }
            let outcome = match queue.flush().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(server, error = %e, "hsi批量定位失败");
                    set_pull_status(ctx, ids, QueueStatus::PrepFailed).await?;
                    success = false;
                    continue;
                }
            };

            let registered = ctx.vocabulary.queue_status(QueueStatus::Registered);
            for (pull_queue_id, location) in outcome.resolved {
                ctx.control_plane
                    .update_pull_entry(
                        pull_queue_id,
                        &PullQueueUpdate {
                            queue_status_id: registered,
                            volume: Some(location.volume),
                            position_a: Some(location.position_a),
                            position_b: Some(location.position_b),
                        },
                    )
                    .await?;
            }
            if !outcome.unresolved.is_empty() {
                warn!(server, unresolved = ?outcome.unresolved, "部分文件未能定位，标记为PREP_FAILED");
                set_pull_status(ctx, outcome.unresolved, QueueStatus::PrepFailed).await?;
                success = false;
            }
        }
        Ok(success)
    }
}

/// 从同一个卷批量取回文件
pub struct PullHandler;

#[async_trait]
impl TaskHandler for PullHandler {
    fn name(&self) -> &'static str {
        "pull"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let records: Vec<PullRecord> = parse_payload(self.name(), task.data.clone())?;
        let Some(first) = records.first() else {
            return Ok(true);
        };
        let service = ctx.backup_service(first.service).await?;
        let server = ctx.tape_server(&service)?;
        let volume = first.volume.clone().unwrap_or_default();
        let ids = || records.iter().map(|r| r.pull_queue_id).collect::<Vec<i64>>();

        if !ctx.probe.is_up(server).await {
            warn!(server, volume = %volume, "磁带服务不可用，记录重新排队");
            ctx.control_plane
                .release_volume_lock(&ctx.division, &volume)
                .await?;
            set_pull_status(ctx, ids(), QueueStatus::Registered).await?;
            return Ok(false);
        }

        info!(volume = %volume, files = records.len(), "开始从卷取回文件");
        let staging_name = format!(
            "tape_{volume}_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let mut settled = HashSet::new();
        let result = match StagingDir::create(ctx.temp_dir(), &staging_name) {
            Ok(staging) => retrieve(ctx, server, &staging, &volume, &records, &mut settled).await,
            Err(e) => Err(e),
        };
        let success = match result {
            Ok(success) => success,
            Err(e) => {
                error!(volume = %volume, error = %e, "取回文件失败");
                let pending: Vec<i64> = ids().into_iter().filter(|id| !settled.contains(id)).collect();
                if let Err(e) = set_pull_status(ctx, pending, QueueStatus::Failed).await {
                    warn!(volume = %volume, error = %e, "更新取回记录状态失败");
                }
                false
            }
        };

        ctx.control_plane
            .release_volume_lock(&ctx.division, &volume)
            .await?;
        info!(volume = %volume, "已释放卷锁");
        Ok(success)
    }
}

/// 单个文件的取回计划
struct RestorePlan {
    pull_queue_id: i64,
    restore_path: PathBuf,
    destination: PathBuf,
    /// 整包中的成员在暂存目录中解压后的位置
    member: Option<PathBuf>,
}

fn bundle_file_name(remote_path: &str) -> &str {
    remote_path.rsplit('/').next().unwrap_or(remote_path)
}

/// 生成按磁带位置排序的取回脚本，每个整包只取一次
fn plan_retrieval(
    staging: &Path,
    records: &[PullRecord],
) -> ArchiverResult<(Vec<RestorePlan>, Vec<String>, BTreeMap<String, Vec<String>>)> {
    let mut plans = Vec::with_capacity(records.len());
    let mut script: BTreeMap<String, String> = BTreeMap::new();
    let mut bundles: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for record in records {
        let destination = record.destination();
        let restore_path = hidden_temp_path(&destination);
        create_dir_with_mode(Path::new(&record.file_path), DIR_MODE)?;

        let (key, command, member) = match (&record.tar_record_id, &record.remote_path) {
            (Some(_), Some(remote_path)) => {
                let local_bundle = staging.join(bundle_file_name(remote_path));
                let member = record.member_path();
                let members = bundles.entry(remote_path.clone()).or_default();
                if !members.contains(&member) {
                    members.push(member.clone());
                }
                (
                    remote_path.clone(),
                    format!("get {} : {}", local_bundle.display(), remote_path),
                    Some(staging.join(member.trim_start_matches('/'))),
                )
            }
            _ => (
                record.remote_file_name.clone(),
                format!("get {} : {}", restore_path.display(), record.tape_object()),
                None,
            ),
        };
        let sort_key = format!(
            "{:015}{:015}{key}",
            record.position_a.unwrap_or_default(),
            record.position_b.unwrap_or_default()
        );
        script.insert(sort_key, command);
        plans.push(RestorePlan {
            pull_queue_id: record.pull_queue_id,
            restore_path,
            destination,
            member,
        });
    }
    Ok((plans, script.into_values().collect(), bundles))
}

async fn retrieve(
    ctx: &HandlerContext,
    server: &str,
    staging: &StagingDir,
    volume: &str,
    records: &[PullRecord],
    settled: &mut HashSet<i64>,
) -> ArchiverResult<bool> {
    let (plans, script, bundles) = plan_retrieval(staging.path(), records)?;
    let script_name = format!("{volume}.cmd");
    let mut contents = script.join("\n");
    contents.push('\n');
    std::fs::write(staging.join(&script_name), contents)?;

    if !ctx.debug {
        info!(volume, commands = script.len(), "执行hsi批量取回脚本");
        if let Err(e) = ctx
            .hsi()
            .run_script(server, staging.path(), &script_name, RETRIEVAL_TIMEOUT)
            .await
        {
            warn!(volume, error = %e, "hsi批量取回失败，全部记录标记为FAILED");
            set_pull_status(ctx, plans.iter().map(|p| p.pull_queue_id).collect::<Vec<i64>>(), QueueStatus::Failed)
                .await?;
            settled.extend(plans.iter().map(|p| p.pull_queue_id));
            return Ok(false);
        }

        for (remote_path, members) in &bundles {
            let spec = CommandSpec::new(TAR_PROGRAM)
                .arg("xvf")
                .arg(bundle_file_name(remote_path))
                .args(members.iter().cloned())
                .current_dir(staging.path());
            if let Err(e) = ctx.runner.run_checked(&spec).await {
                error!(bundle = %remote_path, error = %e, "解包失败");
                for member in members {
                    let _ = std::fs::remove_file(staging.join(member.trim_start_matches('/')));
                }
            }
        }
    }

    let complete = ctx.vocabulary.queue_status(QueueStatus::Complete);
    let failed = ctx.vocabulary.queue_status(QueueStatus::Failed);
    let mut all_restored = true;
    for plan in plans {
        let RestorePlan {
            pull_queue_id,
            restore_path,
            destination,
            member,
        } = plan;
        // 整包成员分两步（复制再改名），暂存目录和目标可能不在同一文件系统
        let moved = blocking(move || {
            if let Some(member) = &member {
                copy_preserving(member, &restore_path)?;
            }
            std::fs::rename(&restore_path, &destination)?;
            Ok::<_, ArchiverError>(destination)
        })
        .await;
        let status = match moved {
            Ok(destination) => {
                info!(pull_queue_id, file = %destination.display(), "文件已取回");
                complete
            }
            Err(e) => {
                warn!(pull_queue_id, error = %e, "文件取回失败");
                all_restored = false;
                failed
            }
        };
        ctx.control_plane
            .update_pull_entry(pull_queue_id, &PullQueueUpdate::status(status))
            .await?;
        settled.insert(pull_queue_id);
    }
    Ok(all_restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, a: i64, b: i64) -> PullRecord {
        PullRecord {
            pull_queue_id: id,
            file_id: Some(id),
            service: 1,
            volume: Some("AG1234".to_string()),
            position_a: Some(a),
            position_b: Some(b),
            tar_record_id: None,
            remote_path: None,
            remote_file_path: "/hpss/backup_2026/data".to_string(),
            remote_file_name: format!("f{id}.{id}"),
            file_path: String::new(),
            file_name: format!("f{id}"),
        }
    }

    #[test]
    fn test_plan_sorts_by_position_and_fetches_each_bundle_once() {
        let temp = tempfile::tempdir().unwrap();
        let restore = temp.path().join("restore");
        let staging = temp.path().join("staging");

        let mut late = record(1, 900, 1);
        late.file_path = restore.display().to_string();
        let mut early = record(2, 10, 5);
        early.file_path = restore.display().to_string();
        let mut bundled_a = record(3, 50, 0);
        bundled_a.file_path = restore.join("b").display().to_string();
        bundled_a.tar_record_id = Some(12);
        bundled_a.remote_path = Some("/hpss/backup_2026/000/000/12.tar".to_string());
        bundled_a.remote_file_path = ".".to_string();
        let mut bundled_b = bundled_a.clone();
        bundled_b.pull_queue_id = 4;
        bundled_b.remote_file_name = "f4.4".to_string();
        bundled_b.file_name = "f4".to_string();

        let records = vec![late, early, bundled_a, bundled_b];
        let (plans, script, bundles) = plan_retrieval(&staging, &records).unwrap();

        assert_eq!(plans.len(), 4);
        assert!(restore.join("b").is_dir());
        assert_eq!(script.len(), 3);
        assert!(script[0].ends_with(": /hpss/backup_2026/data/f2.2"));
        assert!(script[0].starts_with(&format!("get {}", restore.join(".f2").display())));
        assert_eq!(
            script[1],
            format!(
                "get {} : /hpss/backup_2026/000/000/12.tar",
                staging.join("12.tar").display()
            )
        );
        assert!(script[2].ends_with(": /hpss/backup_2026/data/f1.1"));
        assert_eq!(
            bundles.get("/hpss/backup_2026/000/000/12.tar").unwrap(),
            &vec!["./f3.3".to_string(), "./f4.4".to_string()]
        );
        assert_eq!(plans[2].member, Some(staging.join("./f3.3")));
    }
}
