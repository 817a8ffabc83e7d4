use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{info, warn};

use archiver_domain::{
    parse_payload, ArchiverResult, FileStatus, FileUpdate, PurgeRequest, Task, SECONDS_IN_DAY,
};

use super::{is_under, path_string, HandlerContext, TaskHandler};

/// 删除已备份的本地副本
pub struct PurgeHandler;

/// 最近访问时间是否落在宽限期内
///
/// 宽限期取 `accessed_window` 与（修改后经过的时间减一天）中较小者。
pub fn within_grace_window(
    accessed_age_seconds: i64,
    modified_age_seconds: i64,
    accessed_window_seconds: i64,
) -> bool {
    accessed_age_seconds < accessed_window_seconds.min(modified_age_seconds - SECONDS_IN_DAY)
}

#[async_trait]
impl TaskHandler for PurgeHandler {
    fn name(&self) -> &'static str {
        "purge"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: PurgeRequest = parse_payload(self.name(), task.data.clone())?;
        let local = request.local_path();
        let purged = FileUpdate::status(ctx.vocabulary.file_status(FileStatus::Purged));

        if !local.exists() {
            ctx.control_plane
                .update_file(request.file_id, &purged)
                .await?;
            return Ok(true);
        }

        // 临时目录中的文件不延期
        if !is_under(&local, ctx.temp_dir()) {
            let modified_age = (chrono::Local::now().naive_local() - request.modified_dt).num_seconds();
            let metadata = match std::fs::metadata(&local) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(file_id = request.file_id, error = %e, "读取文件属性失败，本次不删除");
                    return Ok(false);
                }
            };
            let accessed_age = metadata
                .accessed()
                .ok()
                .and_then(|accessed| SystemTime::now().duration_since(accessed).ok())
                .map_or(0, |age| age.as_secs() as i64);
            if within_grace_window(
                accessed_age,
                modified_age,
                ctx.settings.purge_accessed_seconds(),
            ) {
                let days = ctx.settings.purge_file_extend_days;
                ctx.control_plane
                    .extend_retention(&path_string(&local), days)
                    .await?;
                info!(file_id = request.file_id, days, "文件近期被访问，延长保留期");
                return Ok(true);
            }
        }

        if let Err(e) = std::fs::remove_file(&local) {
            warn!(file_id = request.file_id, error = %e, "删除文件失败");
        }
        if local.exists() {
            return Ok(false);
        }
        ctx.control_plane
            .update_file(request.file_id, &purged)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_window_uses_smaller_bound() {
        let ten_days = 10 * SECONDS_IN_DAY;
        // 修改于30天前，一小时前被访问：延期
        assert!(within_grace_window(3600, 30 * SECONDS_IN_DAY, ten_days));
        // 访问发生在11天前：超出10天窗口
        assert!(!within_grace_window(11 * SECONDS_IN_DAY, 30 * SECONDS_IN_DAY, ten_days));
        // 刚修改过的文件（不到一天）总是允许删除
        assert!(!within_grace_window(0, 3600, ten_days));
        // 修改于3天前时窗口缩短为2天
        assert!(within_grace_window(SECONDS_IN_DAY, 3 * SECONDS_IN_DAY, ten_days));
        assert!(!within_grace_window(2 * SECONDS_IN_DAY + 1, 3 * SECONDS_IN_DAY, ten_days));
    }
}
