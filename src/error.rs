use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 数据集处理过程中的错误
///
/// 除了 `Config` 与 `Table` 以外，其余错误都只影响单张图片、单个分片或单个归档，
/// 调用方记录日志后应当继续处理下一项
#[derive(Debug, Error)]
pub enum PrepError {
    /// 无法解码为受支持的图片格式
    #[error("图片解码失败: {0}")]
    Decode(String),
    /// 文件名对应的 ID 不在评分表中
    #[error("评分表中不存在 ID {0}")]
    UnknownId(u64),
    /// 同一个 ID 出现了多个文件
    #[error("ID {0} 重复")]
    DuplicateId(u64),
    /// 空文件
    #[error("文件大小为 0: {}", .0.display())]
    SizeZero(PathBuf),
    /// 归档无法打开或解压
    #[error("读取归档失败 {}: {reason}", path.display())]
    ArchiveRead { path: PathBuf, reason: String },
    /// 嵌入模型调用失败
    #[error("模型调用失败: {0}")]
    ModelInvocation(String),
    /// 输出文件写入失败
    #[error("写入失败 {}: {source}", path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// 评分表格式错误
    #[error("评分表第 {line} 行格式错误: {reason}")]
    Table { line: usize, reason: String },
    /// 无法继续运行的配置错误
    #[error("配置错误: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PrepError {
    pub fn output(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OutputWrite { path: path.into(), source }
    }

    pub fn archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ArchiveRead { path: path.into(), reason: reason.to_string() }
    }
}

impl From<image::ImageError> for PrepError {
    fn from(err: image::ImageError) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T, E = PrepError> = std::result::Result<T, E>;
