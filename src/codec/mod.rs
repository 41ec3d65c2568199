//! 图像编解码模块
//!
//! 出站: RGB 画面 -> JPEG；入站: JPEG -> RGBA 画面。
//! 质量固定，不做自适应码率

use crate::capture::VideoFrame;
use crate::protocol::EncodedFrame;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

/// 浏览器 canvas.toDataURL("image/jpeg") 的默认质量
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// 编解码错误
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JPEG encode failed: {0}")]
    Encode(String),

    #[error("JPEG decode failed: {0}")]
    Decode(String),

    #[error("Invalid frame dimensions {0}x{1}")]
    InvalidDimensions(u32, u32),

    #[error("Codec task failed: {0}")]
    Task(String),
}

/// 解码后的画面
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub image: RgbaImage,
}

impl DecodedFrame {
    pub fn new(image: RgbaImage) -> Self {
        DecodedFrame {
            width: image.width(),
            height: image.height(),
            image,
        }
    }
}

/// 帧编码器 trait
pub trait FrameEncoder: Send + Sync {
    /// 编码一帧
    fn encode(&self, frame: &VideoFrame) -> Result<EncodedFrame, CodecError>;
}

/// 帧解码器 trait
///
/// 解码是异步的，多个解码可以同时进行
#[async_trait]
pub trait FrameDecoder: Send + Sync {
    async fn decode(&self, frame: EncodedFrame) -> Result<DecodedFrame, CodecError>;
}

/// JPEG 编码器
pub struct JpegFrameEncoder {
    quality: u8,
    max_width: Option<u32>,
}

impl JpegFrameEncoder {
    /// 创建新的 JPEG 编码器
    ///
    /// # 参数
    /// * `quality` - JPEG 质量 (1-100)
    /// * `max_width` - 超过此宽度时按比例缩小 (None = 原始尺寸)
    pub fn new(quality: u8, max_width: Option<u32>) -> Self {
        tracing::info!(quality, ?max_width, "创建 JPEG 编码器");
        JpegFrameEncoder {
            quality: quality.clamp(1, 100),
            max_width,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        JpegFrameEncoder::new(DEFAULT_JPEG_QUALITY, None)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &VideoFrame) -> Result<EncodedFrame, CodecError> {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return Err(CodecError::InvalidDimensions(w, h));
        }

        match self.max_width {
            Some(max_width) if w > max_width => {
                let (dst_w, dst_h) = scaled_dimensions(w, h, max_width);
                let scaled = imageops::resize(frame.image(), dst_w, dst_h, FilterType::Triangle);
                encode_jpeg(&scaled, self.quality)
            }
            _ => encode_jpeg(frame.image(), self.quality),
        }
    }
}

/// JPEG 解码器 (在阻塞线程池中解码)
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegFrameDecoder;

#[async_trait]
impl FrameDecoder for JpegFrameDecoder {
    async fn decode(&self, frame: EncodedFrame) -> Result<DecodedFrame, CodecError> {
        tokio::task::spawn_blocking(move || decode_jpeg(frame.as_bytes()))
            .await
            .map_err(|e| CodecError::Task(e.to_string()))?
    }
}

/// JPEG 编码 RGB 图像
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<EncodedFrame, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    image
        .write_with_encoder(encoder)
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    Ok(EncodedFrame::new(buf.into_inner()))
}

/// JPEG 解码为 RGBA 图像
pub fn decode_jpeg(data: &[u8]) -> Result<DecodedFrame, CodecError> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(DecodedFrame::new(image.to_rgba8()))
}

/// 按最大宽度等比缩放
fn scaled_dimensions(src_w: u32, src_h: u32, max_width: u32) -> (u32, u32) {
    let scale = max_width as f64 / src_w as f64;
    let dst_h = ((src_h as f64 * scale).round() as u32).max(1);
    (max_width, dst_h)
}
