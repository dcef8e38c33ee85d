//! 图片嵌入向量
//!
//! 输入为若干「单元」（zip 归档、tar 归档或一个图片目录），每个单元输出一个 JSON 文档。
//! 加载与计算重叠进行，最多预读一个单元。

use std::io;
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

mod loader;
mod pipeline;
mod thumbnail;

pub use loader::*;
pub use pipeline::*;
pub use thumbnail::*;

use crate::error::{PrepError, Result};

/// 一张图片的嵌入记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// 所在归档的文件名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_archive: Option<String>,
    pub file_name: String,
    /// 归档内或相对输入目录的路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub file_hash: String,
    /// 不同模型的向量不可比较，因此每条记录都带上模型名
    #[serde(rename = "clip_model")]
    pub model_id: String,
    #[serde(rename = "clip_vector")]
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// 嵌入模型
///
/// 返回的向量数量与顺序必须与输入一致
pub trait ImageEmbedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn embed(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>>;
}

/// 根据模型名构造嵌入模型
pub fn load_embedder(model_id: &str) -> Result<Arc<dyn ImageEmbedder>> {
    if let Some(size) = model_id.strip_prefix(ThumbnailEmbedder::PREFIX) {
        let size = size
            .parse::<u32>()
            .ok()
            .filter(|s| (1..=ThumbnailEmbedder::MAX_SIZE).contains(s))
            .ok_or_else(|| PrepError::Config(format!("无效的缩略图尺寸: {}", model_id)))?;
        return Ok(Arc::new(ThumbnailEmbedder::new(size)));
    }
    Err(PrepError::Config(format!("未知的模型: {}", model_id)))
}

pub fn read_embeddings(data: &[u8]) -> Result<Vec<EmbeddingRecord>> {
    serde_json::from_slice(data).map_err(|e| PrepError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::JsonWriter;

    #[test]
    fn test_load_embedder() {
        assert_eq!(load_embedder("thumbnail-16").unwrap().model_id(), "thumbnail-16");
        assert!(matches!(load_embedder("thumbnail-0"), Err(PrepError::Config(_))));
        assert!(matches!(load_embedder("thumbnail-x"), Err(PrepError::Config(_))));
        assert!(matches!(load_embedder("ViT-B/32"), Err(PrepError::Config(_))));
    }

    #[test]
    fn test_record_field_names() {
        let record = EmbeddingRecord {
            file_archive: Some("dataset-ava-000.zip".into()),
            file_name: "1.jpg".into(),
            file_path: None,
            file_hash: "ab".into(),
            model_id: "thumbnail-2".into(),
            vector: vec![0.5, -0.5],
            tag: None,
        };
        let json = String::from_utf8(JsonWriter::new(0).to_vec(&[&record]).unwrap()).unwrap();
        assert_eq!(
            json,
            r#"[{"file_archive":"dataset-ava-000.zip","file_name":"1.jpg","file_hash":"ab","#.to_owned()
                + r#""clip_model":"thumbnail-2","clip_vector":[0.5,-0.5]}]"#
        );
        assert_eq!(read_embeddings(json.as_bytes()).unwrap(), vec![record]);
    }
}
