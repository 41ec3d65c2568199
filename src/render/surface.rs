//! 绘制表面
//!
//! 固定声明尺寸的 RGBA 画布。每次绘制先清空，再把图像缩放到声明尺寸绘入

use crate::codec::{encode_jpeg, CodecError};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, Rgba, RgbaImage};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct SurfaceState {
    pixels: RgbaImage,
    painted: u64,
}

/// 可共享的绘制表面
#[derive(Clone)]
pub struct Surface {
    inner: Arc<RwLock<SurfaceState>>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Surface {
            inner: Arc::new(RwLock::new(SurfaceState {
                pixels: RgbaImage::new(width.max(1), height.max(1)),
                painted: 0,
            })),
        }
    }

    /// 声明尺寸
    pub fn size(&self) -> (u32, u32) {
        self.read().pixels.dimensions()
    }

    /// 修改声明尺寸，画布内容随之清空
    pub fn resize(&self, width: u32, height: u32) {
        self.write().pixels = RgbaImage::new(width.max(1), height.max(1));
    }

    /// 把图像缩放到当前声明尺寸 (CPU 密集，应在阻塞线程中调用)
    pub fn fit(&self, image: RgbaImage) -> RgbaImage {
        let (width, height) = self.size();
        if image.dimensions() == (width, height) {
            image
        } else {
            imageops::resize(&image, width, height, FilterType::Triangle)
        }
    }

    /// 清空后绘制图像 (缩放到声明尺寸)
    pub fn paint(&self, image: &RgbaImage) {
        let scaled = self.fit(image.clone());

        let mut state = self.write();
        // 绘制期间尺寸可能被修改
        if state.pixels.dimensions() != scaled.dimensions() {
            let (w, h) = state.pixels.dimensions();
            let rescaled = imageops::resize(&scaled, w, h, FilterType::Triangle);
            draw(&mut state.pixels, &rescaled);
        } else {
            draw(&mut state.pixels, &scaled);
        }
        state.painted += 1;
    }

    /// 绘制 RGB 图像
    pub fn paint_rgb(&self, image: &RgbImage) {
        let rgba = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
        self.paint(&rgba);
    }

    /// 当前画布内容的拷贝
    pub fn snapshot(&self) -> RgbaImage {
        self.read().pixels.clone()
    }

    /// 已绘制次数
    pub fn painted_count(&self) -> u64 {
        self.read().painted
    }

    /// 以 JPEG 导出当前画布 (查看器使用)
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, CodecError> {
        let rgb = DynamicImage::ImageRgba8(self.snapshot()).to_rgb8();
        let encoded = encode_jpeg(&rgb, quality)?;
        Ok(encoded.as_bytes().to_vec())
    }

    fn read(&self) -> RwLockReadGuard<'_, SurfaceState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SurfaceState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clear_pixels(pixels: &mut RgbaImage) {
    for pixel in pixels.pixels_mut() {
        *pixel = Rgba([0, 0, 0, 0]);
    }
}

fn draw(pixels: &mut RgbaImage, image: &RgbaImage) {
    clear_pixels(pixels);
    // 画布已清空，source-over 合成等价于直接拷贝
    imageops::replace(pixels, image, 0, 0);
}
