use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use archiver_domain::ArchiverResult;

/// 以任务为单位命名的暂存目录，离开作用域时连同内容一起删除
///
/// 目录名由调用方保证唯一（tar记录id、卷号加时间戳等），并发Worker之间不会冲突。
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn create(parent: &Path, name: &str) -> ArchiverResult<Self> {
        let path = parent.join(name);
        std::fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "创建暂存目录");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// 在暂存目录中建立指向 `target` 的符号链接，已存在的同名项先删除
    pub fn link(&self, target: &Path, name: &str) -> ArchiverResult<PathBuf> {
        let link = self.path.join(name);
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(target, &link)?;
        Ok(link)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "删除暂存目录失败");
            }
        }
    }
}
