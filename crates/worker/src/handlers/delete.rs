use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use archiver_domain::{
    parse_payload, ArchiverResult, DeleteRequest, QueueStatus, RemoveRequest, Task,
};

use super::{HandlerContext, TaskHandler};

/// 删除大小与记录一致的文件，并向上清理变空的目录
pub struct DeleteHandler;

/// 从 `dir` 开始逐级删除空目录，返回删除的层数
pub fn remove_empty_dirs(dir: &Path) -> usize {
    let mut removed = 0;
    let mut current = Some(dir);
    while let Some(path) = current {
        let is_empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || std::fs::remove_dir(path).is_err() {
            break;
        }
        debug!(dir = %path.display(), "删除空目录");
        removed += 1;
        current = path.parent();
    }
    removed
}

#[async_trait]
impl TaskHandler for DeleteHandler {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn handle(&self, _ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: DeleteRequest = parse_payload(self.name(), task.data.clone())?;
        let dir = Path::new(&request.file_path);
        let local = dir.join(&request.file_name);
        match std::fs::metadata(&local) {
            Ok(metadata) if metadata.len() == request.file_size => {
                if let Err(e) = std::fs::remove_file(&local) {
                    warn!(file = %local.display(), error = %e, "删除文件失败");
                    return Ok(false);
                }
                let removed = remove_empty_dirs(dir);
                info!(file = %local.display(), removed_dirs = removed, "文件已删除");
            }
            Ok(metadata) => {
                warn!(
                    file = %local.display(),
                    expected = request.file_size,
                    actual = metadata.len(),
                    "文件大小与记录不一致，不删除"
                );
            }
            Err(_) => debug!(file = %local.display(), "文件不存在"),
        }
        Ok(true)
    }
}

/// 删除文件或整个目录，并上报通用任务状态
pub struct GeneralHandler;

#[async_trait]
impl TaskHandler for GeneralHandler {
    fn name(&self) -> &'static str {
        "general"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: RemoveRequest = parse_payload(self.name(), task.data.clone())?;
        let target = Path::new(&request.file);
        let result = if target.is_dir() {
            std::fs::remove_dir_all(target)
        } else {
            std::fs::remove_file(target)
        };

        let status = match &result {
            Ok(()) => QueueStatus::Complete,
            Err(e) => {
                warn!(file = %target.display(), error = %e, "删除失败");
                QueueStatus::Failed
            }
        };
        ctx.control_plane
            .update_task_status(request.task_id, ctx.vocabulary.queue_status(status))
            .await?;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_empty_dirs_stops_at_non_empty_parent() {
        let temp = tempfile::tempdir().unwrap();
        let keep = temp.path().join("a");
        std::fs::create_dir_all(keep.join("b/c/d")).unwrap();
        std::fs::write(keep.join("other.txt"), b"x").unwrap();

        assert_eq!(remove_empty_dirs(&keep.join("b/c/d")), 3);
        assert!(!keep.join("b").exists());
        assert!(keep.join("other.txt").exists());
        assert_eq!(remove_empty_dirs(&keep), 0);
    }
}
