use std::path::Path;

use clap::ValueEnum;
use indicatif::ProgressStyle;
use regex::Regex;
use sha2::{Digest, Sha256};

/// 计算文件哈希使用的算法
///
/// 哈希值会作为数据集中图片的稳定标识，同一个数据集必须始终使用同一种算法
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageHash {
    /// SHA-256，与已发布的 AVA 清单兼容
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

impl ImageHash {
    /// 计算字节的 256 位哈希，返回小写十六进制字符串
    pub fn hash_bytes(&self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }
}

/// 图片后缀白名单，所有入口共用同一个判断逻辑
#[derive(Debug, Clone)]
pub struct ImageFilter {
    re: Regex,
}

impl ImageFilter {
    /// 从逗号分隔的后缀列表构建，忽略大小写
    pub fn new(suffix: &str) -> Result<Self, regex::Error> {
        let alts = suffix
            .split(',')
            .map(|s| regex::escape(s.trim().trim_start_matches('.')))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("|");
        let re = Regex::new(&format!("(?i)^({})$", alts))?;
        Ok(Self { re })
    }

    pub fn accepts(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .extension()
            .map(|ext| self.re.is_match(&ext.to_string_lossy()))
            .unwrap_or(false)
    }
}

/// 从文件名中解析图片 ID，文件名（不含后缀）必须为纯数字
pub fn image_id(path: impl AsRef<Path>) -> Option<u64> {
    let stem = path.as_ref().file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// 分片名称，例如 `dataset-ava-007`
pub fn shard_name(prefix: &str, index: usize) -> String {
    format!("{}{:03}", prefix, index)
}

/// 从分片名称解析序号，名称必须与 `shard_name` 生成的完全一致
pub fn shard_index(prefix: &str, name: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;
    (shard_name(prefix, index) == name).then_some(index)
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} {msg}")
        .expect("invalid progress template")
        .progress_chars("##-")
}

pub fn pb_style_speed() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {spinner} {pos} ({per_sec}, {binary_bytes_per_sec}) {msg}",
    )
    .expect("invalid progress template")
}
