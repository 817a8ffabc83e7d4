use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use archiver_domain::{
    parse_payload, ArchiverError, ArchiverResult, CopyRequest, FileStatus, FileUpdate,
    RemoteSource, Task,
};

use super::{
    blocking, copy_times, create_dir_with_mode, file_name_of, is_under, path_string,
    HandlerContext, TaskHandler, DIR_MODE, FILE_MODE,
};
use crate::command::{CommandRunner, CommandSpec};
use crate::paths::hidden_temp_path;

pub const RSYNC_PROGRAM: &str = "rsync";

/// 把文件从来源位置复制到目标位置，来源可以是本地路径或rsync远程挂载
pub struct CopyHandler;

#[async_trait]
impl TaskHandler for CopyHandler {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: CopyRequest = parse_payload(self.name(), task.data.clone())?;
        let origin = request.origin();
        let destination = request.destination();
        let remote = ctx
            .settings
            .remote_source(request.source.as_deref(), &path_string(&origin));

        let result = async {
            let copied_size = match remote {
                Some(remote) => {
                    let stats =
                        rsync(ctx.runner.as_ref(), &origin, &destination, remote).await?;
                    // 0表示rsync判断目标无需更新，没有传输任何数据
                    stats
                        .get("total_transferred_file_size")
                        .copied()
                        .filter(|size| *size > 0)
                }
                None => {
                    let (origin, destination) = (origin.clone(), destination.clone());
                    Some(blocking(move || local_copy(&origin, &destination)).await?)
                }
            };

            if let Some(size) = copied_size {
                if size != request.file_size {
                    warn!(
                        file_id = request.file_id,
                        expected = request.file_size,
                        actual = size,
                        "复制后的文件大小与记录不一致"
                    );
                    ctx.control_plane
                        .update_file(request.file_id, &FileUpdate::size(size))
                        .await?;
                }
            }
            ctx.control_plane
                .update_file(
                    request.file_id,
                    &FileUpdate::status(ctx.vocabulary.file_status(FileStatus::CopyComplete)),
                )
                .await?;

            // 状态已记为COPY_COMPLETE后才删除本系统生成的临时来源文件
            let temp_root = remote.map_or(ctx.temp_dir(), |r| r.path_temp.as_path());
            if is_under(&origin, temp_root) {
                std::fs::remove_file(&origin)?;
            }
            Ok::<_, ArchiverError>(())
        };

        match result.await {
            Ok(()) => {
                info!(file_id = request.file_id, destination = %destination.display(), "文件复制完成");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    file_id = request.file_id,
                    origin = %origin.display(),
                    destination = %destination.display(),
                    error = %e,
                    "文件复制失败"
                );
                ctx.control_plane
                    .update_file(
                        request.file_id,
                        &FileUpdate::status(ctx.vocabulary.file_status(FileStatus::CopyFailed)),
                    )
                    .await?;
                Ok(false)
            }
        }
    }
}

/// 先写入隐藏的临时名再改名，返回复制后的大小
fn local_copy(origin: &Path, destination: &Path) -> ArchiverResult<u64> {
    if let Some(parent) = destination.parent() {
        create_dir_with_mode(parent, DIR_MODE)?;
    }
    let temp_file = hidden_temp_path(destination);
    std::fs::copy(origin, &temp_file)?;
    std::fs::rename(&temp_file, destination)?;
    std::fs::set_permissions(destination, std::fs::metadata(origin)?.permissions())?;
    copy_times(origin, destination)?;
    std::fs::set_permissions(destination, std::fs::Permissions::from_mode(FILE_MODE))?;
    Ok(std::fs::metadata(destination)?.len())
}

/// 通过rsync写入远程挂载
///
/// rsync不会创建多级父目录，因此在临时目录里按目标相对路径建立符号链接后同步整个目录。
pub(crate) async fn rsync(
    runner: &dyn CommandRunner,
    source: &Path,
    destination: &Path,
    remote: &RemoteSource,
) -> ArchiverResult<HashMap<String, u64>> {
    let link_root = tempfile::Builder::new().suffix("tmp").tempdir()?;
    let parent = destination
        .parent()
        .map(path_string)
        .unwrap_or_default();
    let relative = if remote.path_prefix_destination.is_empty() {
        parent
    } else {
        parent.replace(&remote.path_prefix_destination, "")
    };
    let link_dir = link_root.path().join(relative.trim_start_matches('/'));
    std::fs::create_dir_all(&link_dir)?;
    std::os::unix::fs::symlink(source, link_dir.join(file_name_of(destination)))?;

    let spec = CommandSpec::new(RSYNC_PROGRAM)
        .args([
            "-aL".to_string(),
            "--no-h".to_string(),
            "--stats".to_string(),
            format!("{}/", link_root.path().display()),
            format!("{}/", remote.rsync_uri.trim_end_matches('/')),
        ])
        .env("RSYNC_PASSWORD", &remote.rsync_password);
    let output = runner.run_checked(&spec).await?;
    parse_rsync_stats(&output.stdout)
}

/// 解析 `--stats` 输出：`Total transferred file size: 1024` -> `total_transferred_file_size`
pub fn parse_rsync_stats(stdout: &str) -> ArchiverResult<HashMap<String, u64>> {
    let pattern = Regex::new(r"([\w\s]+): (\d+)")
        .map_err(|e| ArchiverError::Internal(format!("无效的正则表达式: {e}")))?;
    let mut stats = HashMap::new();
    for line in stdout.lines() {
        if let Some(captures) = pattern.captures(line) {
            let key = captures[1].trim().to_lowercase().replace(' ', "_");
            if let Ok(value) = captures[2].parse::<u64>() {
                stats.insert(key, value);
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rsync_stats() {
        let stdout = "\nNumber of files: 3 (reg: 1, dir: 2)\nNumber of regular files transferred: 1\nTotal file size: 2048 bytes\nTotal transferred file size: 1024 bytes\nsent 1200 bytes  received 35 bytes\n";
        let stats = parse_rsync_stats(stdout).unwrap();
        assert_eq!(stats.get("number_of_files"), Some(&3));
        assert_eq!(stats.get("number_of_regular_files_transferred"), Some(&1));
        assert_eq!(stats.get("total_transferred_file_size"), Some(&1024));
        assert_eq!(stats.get("total_file_size"), Some(&2048));
    }

    #[test]
    fn test_local_copy_uses_hidden_name_and_sets_mode() {
        let temp = tempfile::tempdir().unwrap();
        let origin = temp.path().join("in/reads.fastq");
        std::fs::create_dir_all(origin.parent().unwrap()).unwrap();
        std::fs::write(&origin, b"ACGTACGT").unwrap();

        let destination = temp.path().join("out/nested/reads.fastq");
        assert_eq!(local_copy(&origin, &destination).unwrap(), 8);
        assert!(!temp.path().join("out/nested/.reads.fastq").exists());
        let mode = std::fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_MODE);
    }
}
