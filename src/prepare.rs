//! 分片前的准备：读取、校验、去除元数据并计算哈希
//!
//! 哈希总是基于最终写入数据集的字节计算，开启去除元数据时即为重新编码后的字节

use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::warn;
use rayon::prelude::*;

use crate::codec::{hash_and_validate, strip_metadata};
use crate::error::{PrepError, Result};
use crate::scan::ImageFile;
use crate::utils::ImageHash;

/// 已通过校验、可以参与分片的图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub id: u64,
    pub path: PathBuf,
    pub file_name: String,
    /// 写入数据集时的字节数
    pub size: u64,
    pub hash: String,
}

#[derive(Debug)]
pub struct FailedImage {
    pub id: u64,
    pub path: PathBuf,
    pub error: PrepError,
}

#[derive(Debug, Default)]
pub struct Prepared {
    /// 保持输入顺序
    pub images: Vec<PreparedImage>,
    pub failed: Vec<FailedImage>,
}

/// 读取图片最终写入数据集的字节
pub fn load_image_bytes(path: &Path, strip: bool) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    if strip { strip_metadata(&data) } else { Ok(data) }
}

fn prepare_one(file: &ImageFile, hash: ImageHash, strip: bool) -> Result<PreparedImage> {
    let data = fs::read(&file.path)?;
    let (data, hash) = if strip {
        let data = strip_metadata(&data)?;
        let hash = hash.hash_bytes(&data);
        (data, hash)
    } else {
        let hash = hash_and_validate(&data, hash).into_result()?;
        (data, hash)
    };
    if data.is_empty() {
        return Err(PrepError::SizeZero(file.path.clone()));
    }
    Ok(PreparedImage {
        id: file.id,
        path: file.path.clone(),
        file_name: file.file_name.clone(),
        size: data.len() as u64,
        hash,
    })
}

/// 并行处理所有图片，结果保持输入顺序
pub fn prepare_images(files: &[ImageFile], hash: ImageHash, strip: bool, pb: &ProgressBar) -> Prepared {
    pb.set_length(files.len() as u64);
    pb.set_position(0);
    let results = files
        .par_iter()
        .progress_with(pb.clone())
        .map(|file| prepare_one(file, hash, strip).map_err(|error| (file, error)))
        .collect::<Vec<_>>();

    let mut prepared = Prepared::default();
    for result in results {
        match result {
            Ok(image) => prepared.images.push(image),
            Err((file, error)) => {
                warn!("图片无效 {}: {}", file.path.display(), error);
                prepared.failed.push(FailedImage { id: file.id, path: file.path.clone(), error });
            }
        }
    }
    prepared
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::codec::tests::png_bytes;

    fn image_file(dir: &Path, id: u64, data: &[u8]) -> ImageFile {
        let file_name = format!("{}.png", id);
        let path = dir.join(&file_name);
        fs::write(&path, data).unwrap();
        ImageFile { id, path, file_name, size: data.len() as u64 }
    }

    #[test]
    fn test_prepare_keeps_order_and_excludes_corrupt() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            image_file(dir.path(), 1, &png_bytes(1, 8)),
            image_file(dir.path(), 2, b"garbage"),
            image_file(dir.path(), 3, &png_bytes(3, 8)),
        ];
        let prepared = prepare_images(&files, ImageHash::Sha256, false, &ProgressBar::hidden());

        let ids = prepared.images.iter().map(|i| i.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(prepared.failed.len(), 1);
        assert_eq!(prepared.failed[0].id, 2);
        assert!(matches!(prepared.failed[0].error, PrepError::Decode(_)));

        let raw = fs::read(&files[0].path).unwrap();
        assert_eq!(prepared.images[0].hash, ImageHash::Sha256.hash_bytes(&raw));
        assert_eq!(prepared.images[0].size, raw.len() as u64);
    }

    #[test]
    fn test_strip_hashes_output_bytes() {
        let dir = TempDir::new().unwrap();
        let files = vec![image_file(dir.path(), 5, &png_bytes(5, 8))];
        let prepared = prepare_images(&files, ImageHash::Blake3, true, &ProgressBar::hidden());
        let shipped = load_image_bytes(&files[0].path, true).unwrap();
        assert_eq!(prepared.images[0].hash, ImageHash::Blake3.hash_bytes(&shipped));
        assert_eq!(prepared.images[0].size, shipped.len() as u64);
    }
}
