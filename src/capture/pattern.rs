//! 测试图案采集源
//!
//! 没有摄像头时使用: 生成一幅随时间移动的渐变图案和一个方块

use super::{CaptureError, CaptureSource, VideoFrame};
use image::{Rgb, RgbImage};

/// 方块边长 (像素)
const BLOCK_SIZE: u32 = 48;

pub struct PatternSource {
    width: u32,
    height: u32,
    started: bool,
    frame_index: u64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        PatternSource {
            width: width.max(1),
            height: height.max(1),
            started: false,
            frame_index: 0,
        }
    }

    /// 修改输出分辨率 (下一帧生效)
    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let shift = (self.frame_index.wrapping_mul(4) % 256) as u32;
        let block_x = (self.frame_index.wrapping_mul(8) % u64::from(w)) as u32;
        let block_y = h / 2;

        RgbImage::from_fn(w, h, |x, y| {
            let in_block = x >= block_x
                && x < block_x + BLOCK_SIZE
                && y >= block_y.saturating_sub(BLOCK_SIZE / 2)
                && y < block_y + BLOCK_SIZE / 2;
            if in_block {
                Rgb([240, 240, 240])
            } else {
                let r = ((x * 255 / w.max(1)) + shift) % 256;
                let g = y * 255 / h.max(1);
                Rgb([r as u8, g as u8, 96])
            }
        })
    }
}

impl CaptureSource for PatternSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.started = true;
        tracing::info!(width = self.width, height = self.height, "测试图案采集源已启动");
        Ok(())
    }

    fn current_frame(&mut self) -> Result<VideoFrame, CaptureError> {
        if !self.started {
            return Err(CaptureError::NotStarted);
        }
        let image = self.render();
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(VideoFrame::new(image))
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.started.then_some((self.width, self.height))
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn name(&self) -> &str {
        "pattern"
    }
}
