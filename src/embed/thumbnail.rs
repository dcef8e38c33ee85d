use image::RgbImage;
use image::imageops::{self, FilterType};

use super::ImageEmbedder;
use crate::error::Result;

/// 内置的缩略图模型
///
/// 将图片缩放到 N×N，按 RGB 展开后减去均值并做 L2 归一化，向量长度为 3N²
#[derive(Debug, Clone)]
pub struct ThumbnailEmbedder {
    size: u32,
    id: String,
}

impl ThumbnailEmbedder {
    pub const PREFIX: &'static str = "thumbnail-";
    pub const MAX_SIZE: u32 = 256;

    pub fn new(size: u32) -> Self {
        Self { size, id: format!("{}{}", Self::PREFIX, size) }
    }

    pub fn dimension(&self) -> usize {
        (self.size * self.size * 3) as usize
    }

    fn embed_one(&self, image: &RgbImage) -> Vec<f32> {
        let small = imageops::resize(image, self.size, self.size, FilterType::Triangle);
        let mut v = small.into_raw().into_iter().map(|p| p as f32 / 255.0).collect::<Vec<_>>();

        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter_mut().for_each(|x| *x -= mean);

        // 纯色图片减去均值后为零向量，保持原样
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl ImageEmbedder for ThumbnailEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn embed(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        Ok(images.iter().map(|img| self.embed_one(img)).collect())
    }
}
