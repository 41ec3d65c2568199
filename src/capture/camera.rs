//! 摄像头采集源 (nokhwa)
//!
//! nokhwa 的 Camera 在部分平台上不是 Send，因此在专用线程内打开设备，
//! 线程持续读取画面并只保留最新一帧

use super::{CaptureError, CaptureSource, VideoFrame};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::{Camera, NokhwaError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// 等待设备打开的最长时间
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CameraSource {
    index: u32,
    width: u32,
    height: u32,
    latest: Arc<Mutex<Option<RgbImage>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    opened: Option<(u32, u32)>,
}

impl CameraSource {
    pub fn new(index: u32, width: u32, height: u32) -> Self {
        CameraSource {
            index,
            width,
            height,
            latest: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            opened: None,
        }
    }
}

impl CaptureSource for CameraSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (init_tx, init_rx) = mpsc::channel();
        let running = self.running.clone();
        let latest = self.latest.clone();
        let (index, width, height) = (self.index, self.width, self.height);
        running.store(true, Ordering::SeqCst);

        let thread = std::thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || {
                let mut camera = match open_camera(index, width, height) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let resolution = camera.resolution();
                let _ = init_tx.send(Ok((resolution.width(), resolution.height())));
                camera_loop(&mut camera, &latest, &running);
                if let Err(e) = camera.stop_stream() {
                    tracing::warn!("关闭摄像头失败: {}", e);
                }
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        match init_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(dims)) => {
                tracing::info!(index, width = dims.0, height = dims.1, "摄像头已打开");
                self.opened = Some(dims);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CaptureError::DeviceUnavailable("打开摄像头超时".to_string()))
            }
        }
    }

    fn current_frame(&mut self) -> Result<VideoFrame, CaptureError> {
        if self.thread.is_none() {
            return Err(CaptureError::NotStarted);
        }
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest
            .clone()
            .map(VideoFrame::new)
            .ok_or_else(|| CaptureError::Frame("摄像头尚未产生画面".to_string()))
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest
            .as_ref()
            .map(|image| image.dimensions())
            .or(self.opened)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::info!(index = self.index, "摄像头已释放");
        }
        self.opened = None;
    }

    fn name(&self) -> &str {
        "camera"
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_camera(index: u32, width: u32, height: u32) -> Result<Camera, CaptureError> {
    let format = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, 30);
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

    let mut camera =
        Camera::new(CameraIndex::Index(index), requested).map_err(classify_error)?;
    camera.open_stream().map_err(classify_error)?;
    Ok(camera)
}

fn camera_loop(camera: &mut Camera, latest: &Mutex<Option<RgbImage>>, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        let decoded = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>());

        match decoded {
            Ok(buffer) => {
                let (w, h) = (buffer.width(), buffer.height());
                // nokhwa 可能依赖不同版本的 image，这里经由原始字节转换
                if let Some(image) = RgbImage::from_raw(w, h, buffer.into_raw()) {
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(image);
                }
            }
            Err(e) => {
                tracing::debug!("读取摄像头画面失败: {}", e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn classify_error(error: NokhwaError) -> CaptureError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}
