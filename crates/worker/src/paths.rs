//! 远端路径分片规则

use std::path::{Path, PathBuf};

use chrono::Datelike;

/// tar包内成员名（含扩展名）的长度上限，保证低于POSIX tar的99字符限制
pub const MAX_MEMBER_NAME_LEN: usize = 90;

/// 把数字补零到 `total_length` 位后按 `group_width` 位切分成目录
///
/// `to_folder_str(1234678987, 10, 2) == "12/34/67/89/87"`
pub fn to_folder_str(number: u64, total_length: usize, group_width: usize) -> String {
    let digits = format!("{number:0>total_length$}");
    let chars: Vec<char> = digits.chars().collect();
    chars
        .chunks(group_width.max(1))
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("/")
}

/// 按年份分片：`/path/to/base/` -> `/path/to/base_2026`
pub fn sharded_path(base: &str, year: i32) -> String {
    format!("{}_{year}", base.trim_end_matches('/'))
}

pub fn current_year() -> i32 {
    chrono::Local::now().year()
}

/// tar对象的相对位置：`000/012/12.tar`
pub fn bundle_object_name(tar_record_id: i64) -> String {
    let folders = to_folder_str(tar_record_id.unsigned_abs(), 9, 3);
    // 去掉最后一组，用完整id作为文件名
    let parent = &folders[..folders.len().saturating_sub(3)];
    format!("{parent}{tar_record_id}.tar")
}

/// tar包内的成员名：`<file_name>.<backup_record_id>`，超长时截断文件名部分
pub fn member_name(file_name: &str, backup_record_id: i64) -> String {
    let extension = format!(".{backup_record_id}");
    let budget = MAX_MEMBER_NAME_LEN.saturating_sub(extension.len());
    let truncated: String = if file_name.chars().count() + extension.len() > MAX_MEMBER_NAME_LEN {
        file_name.chars().take(budget).collect()
    } else {
        file_name.to_string()
    };
    format!("{truncated}{extension}")
}

/// 单文件在磁带上的完整路径：`<分片根>/<去掉开头'/'的本地路径>.<backup_record_id>`
pub fn single_file_remote_path(
    default_path: &str,
    year: i32,
    local_file: &Path,
    backup_record_id: i64,
) -> String {
    let local = local_file.to_string_lossy();
    format!(
        "{}/{}.{backup_record_id}",
        sharded_path(default_path, year),
        local.trim_start_matches('/')
    )
}

/// 计算从 `link` 指向 `target` 的相对链接
pub fn relative_link(link: &Path, target: &Path) -> PathBuf {
    let link_parent = link.parent().unwrap_or_else(|| Path::new(""));
    let link_parts: Vec<_> = link_parent.components().collect();
    let target_parts: Vec<_> = target.components().collect();
    let common = link_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..link_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    relative
}

/// 把文件名改成以 `.` 开头的隐藏临时名
pub fn hidden_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}"))
}
