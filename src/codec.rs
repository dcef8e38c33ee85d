//! 图片校验、去除元数据与哈希

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage};

use crate::error::{PrepError, Result};
use crate::utils::ImageHash;

/// 单张图片的校验结果
#[derive(Debug)]
pub struct Checked {
    /// 传入字节的哈希
    pub hash: String,
    /// 解码失败时的错误
    pub decode_error: Option<PrepError>,
}

impl Checked {
    pub fn is_valid(&self) -> bool {
        self.decode_error.is_none()
    }

    /// 转换为 Result，校验失败时返回解码错误
    pub fn into_result(self) -> Result<String> {
        match self.decode_error {
            None => Ok(self.hash),
            Some(err) => Err(err),
        }
    }
}

/// 计算哈希并完整解码一次图片以确认数据未损坏
pub fn hash_and_validate(data: &[u8], hash: ImageHash) -> Checked {
    let decode_error = decode(data).err();
    Checked { hash: hash.hash_bytes(data), decode_error }
}

pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    if data.is_empty() {
        return Err(PrepError::Decode("空数据".to_owned()));
    }
    Ok(image::load_from_memory(data)?)
}

/// 解码为 RGB 图片，供嵌入模型使用
pub fn decode_rgb(data: &[u8]) -> Result<RgbImage> {
    decode(data).map(|img| img.to_rgb8())
}

/// 用原格式重新编码图片，丢弃 EXIF 等所有附加信息
pub fn strip_metadata(data: &[u8]) -> Result<Vec<u8>> {
    let format = image::guess_format(data)?;
    let mut img = decode(data)?;
    // JPEG 编码器不接受透明通道
    if format == ImageFormat::Jpeg && img.color().has_alpha() {
        img = DynamicImage::ImageRgb8(img.to_rgb8());
    }
    let mut output = Vec::with_capacity(data.len());
    img.write_to(&mut Cursor::new(&mut output), format)?;
    Ok(output)
}
