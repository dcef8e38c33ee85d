use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{PrepError, Result};
use crate::utils::{ImageFilter, image_id};

/// 磁盘上的一张图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub id: u64,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

/// 目录扫描结果
#[derive(Debug, Default)]
pub struct ScanReport {
    /// 按 ID 升序排列的图片
    pub files: Vec<ImageFile>,
    /// 被排除的文件及原因
    pub rejected: Vec<(PathBuf, PrepError)>,
}

/// 扫描目录下（不递归）的所有图片
///
/// 文件名必须为纯数字，后缀必须在白名单内，空文件与重复 ID 会被排除
pub fn scan_images(dir: &Path, filter: &ImageFilter) -> Result<ScanReport> {
    if !dir.is_dir() {
        return Err(PrepError::Config(format!("输入目录不存在: {}", dir.display())));
    }
    info!("开始扫描目录: {}", dir.display());

    let mut report = ScanReport::default();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("无法读取目录项: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if !filter.accepts(&path) {
            debug!("跳过非图片文件: {}", path.display());
            continue;
        }
        let Some(id) = image_id(&path) else {
            warn!("文件名不是数字 ID，已跳过: {}", path.display());
            continue;
        };
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                report.rejected.push((path, e.into()));
                continue;
            }
        };
        if size == 0 {
            let err = PrepError::SizeZero(path.clone());
            warn!("{}", err);
            report.rejected.push((path, err));
            continue;
        }
        let file_name = entry_name(&path);
        report.files.push(ImageFile { id, path, file_name, size });
    }

    report.files.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.file_name.cmp(&b.file_name)));

    // 同一 ID 只保留排序后的第一个文件
    let mut files: Vec<ImageFile> = Vec::with_capacity(report.files.len());
    for file in report.files.drain(..) {
        if files.last().is_some_and(|last| last.id == file.id) {
            let err = PrepError::DuplicateId(file.id);
            warn!("{}: {}", file.path.display(), err);
            report.rejected.push((file.path, err));
        } else {
            files.push(file);
        }
    }
    report.files = files;

    info!("扫描完成，共 {} 张图片，排除 {} 个文件", report.files.len(), report.rejected.len());
    Ok(report)
}

/// 列出已分片目录下的所有子目录，按名称排序
pub fn list_shard_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(PrepError::Config(format!("目录不存在: {}", root.display())));
    }
    let mut dirs = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

pub fn entry_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}
