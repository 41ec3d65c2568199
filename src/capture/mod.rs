//! 视频采集模块
//!
//! 提供摄像头/测试图案的采集抽象。采集源在会话开始时获取一次，
//! 之后按需读取"当前画面"

use crate::config::{CaptureConfig, SourceKind};
use image::RgbImage;
use thiserror::Error;

pub mod pattern;

#[cfg(feature = "webcam")]
pub mod camera;

pub use pattern::PatternSource;

#[cfg(feature = "webcam")]
pub use camera::CameraSource;

/// 采集错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture source not started")]
    NotStarted,

    #[error("Failed to read frame: {0}")]
    Frame(String),
}

/// 当前画面 (原始分辨率 RGB)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    image: RgbImage,
}

impl VideoFrame {
    pub fn new(image: RgbImage) -> Self {
        VideoFrame { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// 采集源 trait
pub trait CaptureSource: Send {
    /// 获取设备 (一次性，失败即终止会话)
    fn start(&mut self) -> Result<(), CaptureError>;

    /// 读取当前画面
    fn current_frame(&mut self) -> Result<VideoFrame, CaptureError>;

    /// 当前原始分辨率 (未启动时为 None)
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// 释放设备
    fn stop(&mut self);

    /// 采集源名称 (用于日志)
    fn name(&self) -> &str;
}

/// 根据配置创建采集源
pub fn create_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    match config.source {
        SourceKind::Pattern => Ok(Box::new(PatternSource::new(config.width, config.height))),
        SourceKind::Camera => create_camera(config),
    }
}

#[cfg(feature = "webcam")]
fn create_camera(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    Ok(Box::new(CameraSource::new(
        config.device_index,
        config.width,
        config.height,
    )))
}

#[cfg(not(feature = "webcam"))]
fn create_camera(_config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    Err(CaptureError::DeviceUnavailable(
        "摄像头采集需要启用 webcam feature".to_string(),
    ))
}
