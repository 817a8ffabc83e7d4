//! 把目录打成tar包并建立成员索引

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use archiver_domain::{
    parse_payload, ArchiverError, ArchiverResult, ExtractSpec, ExtractedFileRegistration,
    FileStatus, FileUpdate, FolderIndexEntry, MetadataUpdate, Task, TarRequest,
};

use super::{blocking, parent_of, path_string, HandlerContext, TaskHandler};
use crate::paths::relative_link;

/// 目录中文件数不少于该值时不为其中的文件建立索引；索引总数超过该值时整个丢弃
pub const MAX_INDEXED_FILES: usize = 100;

pub struct TarHandler;

/// tar包中的一个条目
#[derive(Debug, Clone, PartialEq)]
enum TarEntry {
    File { source: PathBuf, name: String },
    Symlink { name: String, target: PathBuf },
}

fn index_entry(relative: &str, id: Option<String>) -> FolderIndexEntry {
    let (file_path, file_name) = match relative.rsplit_once('/') {
        Some((folder, name)) => (folder.to_string(), name.to_string()),
        None => (String::new(), relative.to_string()),
    };
    FolderIndexEntry {
        file_name,
        file_path,
        id,
    }
}

/// 目录中非目录条目的数量（指向目录的链接按目录计）
fn files_in_dir(dir: &Path, cache: &mut HashMap<PathBuf, usize>) -> usize {
    *cache.entry(dir.to_path_buf()).or_insert_with(|| {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| !entry.path().is_dir())
                    .count()
            })
            .unwrap_or(0)
    })
}

async fn register_extracted(
    ctx: &HandlerContext,
    request: &TarRequest,
    file: &Path,
    spec: &ExtractSpec,
) -> ArchiverResult<String> {
    let mut metadata = request.metadata.clone();
    metadata.extend(spec.metadata.clone());
    let destination = request.origin_file_name.as_ref().map(|_| {
        path_string(
            &Path::new(&request.file_path)
                .join(&request.file_name)
                .join(&spec.path),
        )
    });
    ctx.control_plane
        .register_extracted_file(&ExtractedFileRegistration {
            file: path_string(file),
            file_type: spec.file_type.clone(),
            destination,
            validate_mode: request.validate_mode.clone(),
            local_purge_days: request.local_purge_days,
            metadata,
            user: request.user.clone(),
        })
        .await
}

/// 遍历目录，决定每个文件是打进包里、作为链接保留，还是只在索引中引用已登记的文件
async fn plan_entries(
    ctx: &HandlerContext,
    request: &TarRequest,
    root: &Path,
) -> ArchiverResult<(Vec<TarEntry>, Vec<FolderIndexEntry>, Vec<FolderIndexEntry>)> {
    let ignore: HashSet<&str> = request.ignore.iter().map(String::as_str).collect();
    let extract: HashMap<&str, &ExtractSpec> =
        request.extract.iter().map(|e| (e.path.as_str(), e)).collect();
    let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let relative_of = |path: &Path| {
        path.strip_prefix(root)
            .map(path_string)
            .unwrap_or_default()
    };

    let mut entries = Vec::new();
    let mut file_index = Vec::new();
    let mut linked = Vec::new();
    let mut dir_counts = HashMap::new();

    let walked: Vec<(PathBuf, bool)> = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir() && ignore.contains(relative_of(entry.path()).as_str()))
        })
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_dir() || entry.path().is_dir() => None,
            Ok(entry) => Some(Ok((entry.path().to_path_buf(), entry.path_is_symlink()))),
            Err(e) => Some(Err(ArchiverError::Io(e.into()))),
        })
        .collect::<ArchiverResult<_>>()?;

    for (path, is_symlink) in walked {
        let path = path.as_path();
        let relative = relative_of(path);
        if ignore.contains(relative.as_str()) {
            continue;
        }

        let mut source = path.to_path_buf();
        if is_symlink {
            let Ok(real_path) = std::fs::canonicalize(path) else {
                warn!(root = %root.display(), member = %relative, "tar目录中存在损坏的链接");
                continue;
            };
            if real_path.starts_with(&canonical_root) {
                let link = canonical_root.join(&relative);
                if link != real_path {
                    entries.push(TarEntry::Symlink {
                        name: relative.clone(),
                        target: relative_link(&link, &real_path),
                    });
                }
                continue;
            }
            if let Some(metadata_id) = ctx
                .control_plane
                .latest_file(&path_string(&real_path))
                .await?
            {
                linked.push(index_entry(&relative, Some(metadata_id)));
                continue;
            }
            source = real_path;
        }

        if let Some(spec) = extract.get(relative.as_str()) {
            let metadata_id = register_extracted(ctx, request, &source, spec).await?;
            linked.push(index_entry(&relative, Some(metadata_id)));
            continue;
        }

        if request.index && files_in_dir(&parent_of(path), &mut dir_counts) < MAX_INDEXED_FILES {
            file_index.push(index_entry(&relative, None));
        }
        if File::open(&source).is_ok() {
            entries.push(TarEntry::File {
                source,
                name: relative,
            });
        } else {
            warn!(file = %source.display(), "文件不可读，跳过");
        }
    }
    Ok((entries, file_index, linked))
}

fn build_tar(tar_file: &Path, entries: &[TarEntry]) -> ArchiverResult<u64> {
    let mut builder = ::tar::Builder::new(File::create(tar_file)?);
    for entry in entries {
        match entry {
            TarEntry::File { source, name } => builder.append_path_with_name(source, name)?,
            TarEntry::Symlink { name, target } => {
                let mut header = ::tar::Header::new_gnu();
                header.set_entry_type(::tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o755);
                builder.append_link(&mut header, name, target)?;
            }
        }
    }
    builder.into_inner()?;
    Ok(std::fs::metadata(tar_file)?.len())
}

#[async_trait]
impl TaskHandler for TarHandler {
    fn name(&self) -> &'static str {
        "tar"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: TarRequest = parse_payload(self.name(), task.data.clone())?;

        // 来源是复制过来的目录（且本地需要保留）时打包来源目录
        let (root, copy_tar, file_path) = match (&request.origin_file_path, &request.origin_file_name)
        {
            (Some(origin_path), Some(origin_name)) if request.local_purge_days != Some(0) => (
                Path::new(origin_path).join(origin_name),
                true,
                origin_path.clone(),
            ),
            _ => (
                Path::new(&request.file_path).join(&request.file_name),
                false,
                request.file_path.clone(),
            ),
        };
        let root = PathBuf::from(path_string(&root).replace(".tar", ""));
        let temp_dir = ctx
            .settings
            .remote_source(request.source.as_deref(), &file_path)
            .map_or(ctx.temp_dir(), |remote| remote.path_temp.as_path());
        let tar_file = temp_dir.join(format!("{}.{}.tar", request.file_name, request.file_id));

        let packed = async {
            let (entries, mut file_index, linked) = plan_entries(ctx, &request, &root).await?;
            let file_size = {
                let tar_file = tar_file.clone();
                blocking(move || build_tar(&tar_file, &entries)).await?
            };
            if file_index.len() > MAX_INDEXED_FILES {
                file_index.clear();
            }
            file_index.extend(linked);

            ctx.control_plane
                .update_metadata(
                    &request.metadata_id,
                    &MetadataUpdate {
                        folder_index: file_index,
                        current_location: path_string(&tar_file),
                        file_size,
                    },
                )
                .await?;
            Ok::<_, ArchiverError>(file_size)
        };
        let file_size = match packed.await {
            Ok(file_size) => file_size,
            Err(e) => {
                warn!(file_id = request.file_id, tar_file = %tar_file.display(), error = %e, "目录打包失败");
                if let Err(remove_err) = std::fs::remove_file(&tar_file) {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(tar_file = %tar_file.display(), error = %remove_err, "删除未完成的tar文件失败");
                    }
                }
                return Err(e);
            }
        };

        let current_path = path_string(&parent_of(&tar_file));
        let current_name = super::file_name_of(&tar_file);
        let cv = &ctx.vocabulary;
        let update = if copy_tar {
            FileUpdate {
                file_status_id: Some(cv.file_status(FileStatus::TarComplete)),
                file_size: Some(file_size),
                origin_file_path: Some(current_path),
                origin_file_name: Some(current_name),
                next_status_id: Some(cv.file_status(FileStatus::CopyReady)),
                ..Default::default()
            }
        } else {
            FileUpdate {
                file_status_id: Some(cv.file_status(FileStatus::TarComplete)),
                file_size: Some(file_size),
                file_path: Some(current_path),
                file_name: Some(current_name),
                origin_file_path: Some(request.file_path.clone()),
                origin_file_name: Some(request.file_name.clone()),
                next_status_id: Some(cv.file_status(FileStatus::BackupReady)),
            }
        };
        ctx.control_plane.update_file(request.file_id, &update).await?;
        info!(file_id = request.file_id, tar_file = %tar_file.display(), file_size, "目录打包完成");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_entry_splits_folder() {
        assert_eq!(
            index_entry("a/b/c.txt", None),
            FolderIndexEntry {
                file_name: "c.txt".to_string(),
                file_path: "a/b".to_string(),
                id: None,
            }
        );
        assert_eq!(index_entry("top.txt", Some("m1".into())).file_path, "");
    }

    #[test]
    fn test_build_tar_with_files_and_links() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data.txt");
        std::fs::write(&data, b"hello").unwrap();
        let tar_file = temp.path().join("out.tar");

        let size = build_tar(
            &tar_file,
            &[
                TarEntry::File {
                    source: data,
                    name: "sub/data.txt".to_string(),
                },
                TarEntry::Symlink {
                    name: "link.txt".to_string(),
                    target: PathBuf::from("sub/data.txt"),
                },
            ],
        )
        .unwrap();
        assert!(size > 0);

        let mut archive = ::tar::Archive::new(File::open(&tar_file).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            if entry.header().entry_type() == ::tar::EntryType::Symlink {
                let target = entry.link_name().unwrap().unwrap().display().to_string();
                seen.push(format!("{name} -> {target}"));
            } else {
                seen.push(name);
            }
        }
        assert_eq!(seen, vec!["sub/data.txt", "link.txt -> sub/data.txt"]);
    }

    #[test]
    fn test_files_in_dir_counts_non_directories() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("d")).unwrap();
        std::fs::write(temp.path().join("a"), b"").unwrap();
        std::fs::write(temp.path().join("b"), b"").unwrap();
        let mut cache = HashMap::new();
        assert_eq!(files_in_dir(temp.path(), &mut cache), 2);
        assert_eq!(cache.len(), 1);
    }
}
