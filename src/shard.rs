//! 分片输出：目录或 zip 归档
//!
//! 清单总是最后写入，清单存在即说明该分片已经完整输出。
//! zip 归档先写入临时文件，完成后再重命名。

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PrepError, Result};
use crate::manifest::{ManifestRecord, read_manifest};
use crate::prepare::{PreparedImage, load_image_bytes};
use crate::utils::shard_index;

/// 图片放入分片目录的方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// 复制，保留原文件
    #[default]
    Copy,
    /// 移动
    Move,
}

pub fn manifest_name(name: &str) -> String {
    format!("{}.json", name)
}

/// 分片清单的位置：目录模式为 `<out>/<name>/<name>.json`，归档模式为 `<out>/<name>.zip`
pub fn shard_output(out: &Path, name: &str, archive: bool) -> PathBuf {
    if archive {
        out.join(format!("{}.zip", name))
    } else {
        out.join(name).join(manifest_name(name))
    }
}

/// 列出输出目录中名称符合分片命名规则的输出，按序号排列
///
/// 目录模式只看子目录，归档模式只看 `.zip` 文件
pub fn list_shard_outputs(out: &Path, prefix: &str, archive: bool) -> Result<BTreeMap<usize, String>> {
    let mut shards = BTreeMap::new();
    if !out.is_dir() {
        return Ok(shards);
    }
    for entry in fs::read_dir(out)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let is_dir = entry.file_type()?.is_dir();
        let name = match (archive, is_dir) {
            (true, false) => file_name.strip_suffix(".zip"),
            (false, true) => Some(file_name),
            _ => None,
        };
        if let Some((index, name)) = name.and_then(|n| Some((shard_index(prefix, n)?, n))) {
            shards.insert(index, name.to_owned());
        }
    }
    Ok(shards)
}

/// 读取已完成分片的清单，分片未完成时返回 `None`
pub fn read_existing_manifest(out: &Path, name: &str, archive: bool) -> Result<Option<Vec<ManifestRecord>>> {
    let path = shard_output(out, name, archive);
    if !path.is_file() {
        return Ok(None);
    }
    let data = if archive {
        let mut zip = ZipArchive::new(File::open(&path)?).map_err(|e| PrepError::archive(&path, e))?;
        let mut entry = zip.by_name(&manifest_name(name)).map_err(|e| PrepError::archive(&path, e))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        data
    } else {
        fs::read(&path)?
    };
    read_manifest(&data).map(Some)
}

/// 正在写入的分片
pub enum ShardWriter {
    Directory { dir: PathBuf, action: Action, strip: bool },
    Archive { path: PathBuf, tmp: PathBuf, zip: ZipWriter<File>, strip: bool },
}

impl ShardWriter {
    pub fn directory(out: &Path, name: &str, action: Action, strip: bool) -> Result<Self> {
        let dir = out.join(name);
        fs::create_dir_all(&dir).map_err(|e| PrepError::output(&dir, e))?;
        Ok(Self::Directory { dir, action, strip })
    }

    pub fn archive(out: &Path, name: &str, strip: bool) -> Result<Self> {
        let path = out.join(format!("{}.zip", name));
        let tmp = out.join(format!("{}.zip.tmp", name));
        let file = File::create(&tmp).map_err(|e| PrepError::output(&tmp, e))?;
        Ok(Self::Archive { path, tmp, zip: ZipWriter::new(file), strip })
    }

    /// 写入一张图片
    pub fn add_image(&mut self, image: &PreparedImage) -> Result<()> {
        match self {
            Self::Directory { dir, action, strip } => {
                let dst = dir.join(&image.file_name);
                if *strip {
                    let data = load_image_bytes(&image.path, true)?;
                    fs::write(&dst, data).map_err(|e| PrepError::output(&dst, e))?;
                    if *action == Action::Move {
                        fs::remove_file(&image.path)?;
                    }
                    return Ok(());
                }
                match action {
                    Action::Copy => {
                        fs::copy(&image.path, &dst).map_err(|e| PrepError::output(&dst, e))?;
                    }
                    Action::Move => {
                        // 跨文件系统时 rename 会失败
                        if fs::rename(&image.path, &dst).is_err() {
                            fs::copy(&image.path, &dst).map_err(|e| PrepError::output(&dst, e))?;
                            fs::remove_file(&image.path)?;
                        }
                    }
                }
                Ok(())
            }
            Self::Archive { strip, .. } => {
                let data = load_image_bytes(&image.path, *strip)?;
                self.add_bytes(&image.file_name, &data)
            }
        }
    }

    /// 写入任意文件，目录模式下直接复制
    pub fn add_file(&mut self, path: &Path, name: &str) -> Result<()> {
        match self {
            Self::Directory { dir, .. } => {
                let dst = dir.join(name);
                fs::copy(path, &dst).map_err(|e| PrepError::output(&dst, e))?;
                Ok(())
            }
            Self::Archive { .. } => {
                let data = fs::read(path)?;
                self.add_bytes(name, &data)
            }
        }
    }

    fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        match self {
            Self::Directory { dir, .. } => {
                let dst = dir.join(name);
                fs::write(&dst, data).map_err(|e| PrepError::output(&dst, e))
            }
            Self::Archive { tmp, zip, .. } => {
                // 图片本身已经压缩过，直接存储
                let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
                zip.start_file(name, options).map_err(|e| PrepError::output(&*tmp, io::Error::other(e)))?;
                zip.write_all(data).map_err(|e| PrepError::output(&*tmp, e))
            }
        }
    }

    /// 写入清单（如果有）并完成分片
    pub fn finish(mut self, manifest: Option<(&str, &[u8])>) -> Result<()> {
        if let Some((name, data)) = manifest {
            self.add_bytes(name, data)?;
        }
        match self {
            Self::Directory { dir, .. } => {
                debug!("分片目录写入完成: {}", dir.display());
                Ok(())
            }
            Self::Archive { path, tmp, zip, .. } => {
                zip.finish().map_err(|e| PrepError::output(&tmp, io::Error::other(e)))?;
                fs::rename(&tmp, &path).map_err(|e| PrepError::output(&path, e))?;
                debug!("分片归档写入完成: {}", path.display());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn image(dir: &Path, id: u64, data: &[u8]) -> PreparedImage {
        let file_name = format!("{}.jpg", id);
        let path = dir.join(&file_name);
        fs::write(&path, data).unwrap();
        PreparedImage { id, path, file_name, size: data.len() as u64, hash: String::new() }
    }

    #[test]
    fn test_directory_copy_and_move() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = image(src.path(), 1, b"one");
        let b = image(src.path(), 2, b"two");

        let mut writer = ShardWriter::directory(out.path(), "s-000", Action::Copy, false).unwrap();
        writer.add_image(&a).unwrap();
        writer.finish(Some(("s-000.json", &b"[]"[..]))).unwrap();
        assert!(a.path.exists());
        assert_eq!(fs::read(out.path().join("s-000/1.jpg")).unwrap(), b"one");

        let mut writer = ShardWriter::directory(out.path(), "s-001", Action::Move, false).unwrap();
        writer.add_image(&b).unwrap();
        writer.finish(None).unwrap();
        assert!(!b.path.exists());
        assert_eq!(fs::read(out.path().join("s-001/2.jpg")).unwrap(), b"two");

        assert_eq!(read_existing_manifest(out.path(), "s-000", false).unwrap(), Some(vec![]));
        assert_eq!(read_existing_manifest(out.path(), "s-001", false).unwrap(), None);
    }

    #[test]
    fn test_archive() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = image(src.path(), 7, b"seven");

        let mut writer = ShardWriter::archive(out.path(), "z-000", false).unwrap();
        writer.add_image(&a).unwrap();
        assert_eq!(read_existing_manifest(out.path(), "z-000", true).unwrap(), None);
        writer.finish(Some(("z-000.json", &b"[]"[..]))).unwrap();

        assert!(!out.path().join("z-000.zip.tmp").exists());
        let mut zip = ZipArchive::new(File::open(out.path().join("z-000.zip")).unwrap()).unwrap();
        let mut data = vec![];
        zip.by_name("7.jpg").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"seven");
        assert_eq!(read_existing_manifest(out.path(), "z-000", true).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_list_shard_outputs() {
        let out = TempDir::new().unwrap();
        for dir in ["s-000", "s-002", "s-x", "other-001"] {
            fs::create_dir(out.path().join(dir)).unwrap();
        }
        fs::write(out.path().join("s-001.zip"), b"").unwrap();
        fs::write(out.path().join("s-003"), b"").unwrap();
        fs::write(out.path().join("s-004.zip.tmp"), b"").unwrap();

        let dirs = list_shard_outputs(out.path(), "s-", false).unwrap();
        assert_eq!(dirs.into_iter().collect::<Vec<_>>(), vec![(0, "s-000".to_owned()), (2, "s-002".to_owned())]);
        let zips = list_shard_outputs(out.path(), "s-", true).unwrap();
        assert_eq!(zips.into_iter().collect::<Vec<_>>(), vec![(1, "s-001".to_owned())]);
        assert!(list_shard_outputs(&out.path().join("none"), "s-", true).unwrap().is_empty());
    }
}
