use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use futures::{StreamExt, future};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{Receiver, channel};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_tar::Archive;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{PrepError, Result};
use crate::scan::entry_name;
use crate::utils::ImageFilter;

/// 一个待处理的单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    Zip(PathBuf),
    Tar(PathBuf),
    /// 目录下（不递归）的图片，`files` 已排序
    Directory { root: PathBuf, dir: PathBuf, files: Vec<PathBuf> },
}

impl UnitSource {
    fn from_archive(path: PathBuf) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "zip" => Some(Self::Zip(path)),
            "tar" => Some(Self::Tar(path)),
            _ => None,
        }
    }

    /// 单元名，也是输出文档的文件名
    ///
    /// 归档取文件名（不含后缀），目录取相对输入目录的路径，以 `_` 连接
    pub fn name(&self) -> String {
        match self {
            Self::Zip(path) | Self::Tar(path) => {
                path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
            }
            Self::Directory { root, dir, .. } => {
                let parts = relative_parts(root, dir);
                if parts.is_empty() { entry_name(dir) } else { parts.join("_") }
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Zip(path) | Self::Tar(path) => path,
            Self::Directory { dir, .. } => dir,
        }
    }
}

/// 单元中的一张图片
#[derive(Debug, Clone)]
pub struct Member {
    /// 归档内的路径，或相对输入目录的路径，统一使用 `/` 分隔
    pub path: String,
    pub data: Vec<u8>,
}

impl Member {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// 路径中的第一级目录
    pub fn tag(&self) -> Option<&str> {
        let (first, _) = self.path.split_once('/')?;
        (!first.is_empty()).then_some(first)
    }
}

/// 已读入内存的单元
#[derive(Debug, Clone)]
pub struct LoadedUnit {
    pub name: String,
    /// 归档文件名，目录单元为 `None`
    pub archive: Option<String>,
    pub members: Vec<Member>,
}

fn relative_parts(root: &Path, path: &Path) -> Vec<String> {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 找出输入路径下的所有单元，按路径排序
///
/// 输入可以是单个归档文件，也可以是目录；目录中的归档与直接包含图片的子目录各自成为一个单元
pub fn discover_units(input: &Path, filter: &ImageFilter) -> Result<Vec<UnitSource>> {
    if input.is_file() {
        return UnitSource::from_archive(input.to_path_buf())
            .map(|unit| vec![unit])
            .ok_or_else(|| PrepError::Config(format!("不支持的归档格式: {}", input.display())));
    }
    if !input.is_dir() {
        return Err(PrepError::Config(format!("输入路径不存在: {}", input.display())));
    }

    let mut units = vec![];
    let mut dirs: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(input).sort_by_file_name() {
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
        if filter.accepts(&path) {
            if let Some(parent) = path.parent() {
                dirs.entry(parent.to_path_buf()).or_default().push(path);
            }
        } else if let Some(unit) = UnitSource::from_archive(path) {
            units.push(unit);
        }
    }
    units.extend(dirs.into_iter().map(|(dir, files)| UnitSource::Directory { root: input.to_path_buf(), dir, files }));
    units.sort_by(|a, b| a.path().cmp(b.path()));

    // 同名单元会写入同一个输出文档
    let mut names: BTreeMap<String, &Path> = BTreeMap::new();
    for unit in &units {
        if let Some(other) = names.insert(unit.name(), unit.path()) {
            return Err(PrepError::Config(format!(
                "{} 与 {} 的单元名相同: {}",
                other.display(),
                unit.path().display(),
                unit.name()
            )));
        }
    }

    info!("共找到 {} 个单元", units.len());
    Ok(units)
}

/// 将单元读入内存
pub async fn load_unit(source: &UnitSource, filter: &ImageFilter) -> Result<LoadedUnit> {
    let name = source.name();
    debug!("读取单元: {}", source.path().display());
    match source {
        UnitSource::Zip(path) => {
            let (zip_path, filter) = (path.clone(), filter.clone());
            let members = spawn_blocking(move || read_zip(&zip_path, &filter))
                .await
                .map_err(|e| PrepError::archive(path, e))??;
            Ok(LoadedUnit { name, archive: Some(entry_name(path)), members })
        }
        UnitSource::Tar(path) => {
            let members = read_tar(path, filter).await.map_err(|e| match e {
                e @ PrepError::ArchiveRead { .. } => e,
                e => PrepError::archive(path, e),
            })?;
            Ok(LoadedUnit { name, archive: Some(entry_name(path)), members })
        }
        UnitSource::Directory { root, files, .. } => {
            let members = read_files(root, files).await;
            Ok(LoadedUnit { name, archive: None, members })
        }
    }
}

fn read_zip(path: &Path, filter: &ImageFilter) -> Result<Vec<Member>> {
    let file = File::open(path).map_err(|e| PrepError::archive(path, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| PrepError::archive(path, e))?;

    let mut members = vec![];
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| PrepError::archive(path, e))?;
        if entry.is_dir() || !filter.accepts(entry.name()) {
            continue;
        }
        let name = entry.name().to_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(|e| PrepError::archive(path, e))?;
        members.push(Member { path: name, data });
    }
    Ok(members)
}

async fn read_tar(path: &Path, filter: &ImageFilter) -> Result<Vec<Member>> {
    let file = tokio::fs::File::open(path).await?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries()?;

    let mut members = vec![];
    // NOTE: tar 的 entries 必须按顺序读取
    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?;
        if !filter.accepts(&path) {
            continue;
        }
        let path = path.to_string_lossy().trim_start_matches("./").to_owned();

        let mut data = Vec::with_capacity(entry.header().size()? as usize);
        entry.read_to_end(&mut data).await?;
        members.push(Member { path, data });
    }
    Ok(members)
}

/// 并发读取目录中的文件，结果保持输入顺序，读取失败的文件会被跳过
async fn read_files(root: &Path, files: &[PathBuf]) -> Vec<Member> {
    futures::stream::iter(files.to_vec())
        .map(|file: PathBuf| {
            let path = relative_parts(root, &file).join("/");
            async move {
                match tokio::fs::read(&file).await {
                    Ok(data) => Some(Member { path, data }),
                    Err(e) => {
                        warn!("读取失败 {}: {}", file.display(), e);
                        None
                    }
                }
            }
        })
        .buffered(num_cpus::get())
        .filter_map(future::ready)
        .collect()
        .await
}

/// 启动加载任务
///
/// 通道容量为 1，且每次都先占用槽位再开始加载，因此处理第 N 个单元时最多只会预读第 N+1 个
pub fn task_load(units: Vec<UnitSource>, filter: ImageFilter) -> (JoinHandle<()>, Receiver<Result<LoadedUnit>>) {
    let (tx, rx) = channel(1);
    let t = tokio::spawn(async move {
        for unit in units {
            let Ok(permit) = tx.reserve().await else {
                break;
            };
            permit.send(load_unit(&unit, &filter).await);
        }
    });
    (t, rx)
}
