//! 应用外壳
//!
//! 把传输层、渲染器、采集源、调度器和查看器串成一个会话，
//! 并负责按顺序拆除

use crate::capture::{create_source, CaptureError, CaptureSource};
use crate::codec::{JpegFrameDecoder, JpegFrameEncoder};
use crate::config::Config;
use crate::render::{RenderStats, RenderStatsSnapshot, ResultRenderer, Surface};
use crate::scheduler::{FrameScheduler, SchedulerStats, SchedulerStatsSnapshot, SharedSource};
use crate::transport::{ConnectionState, Transport, TransportConfig, TransportStatsSnapshot};
use crate::viewer::WebViewer;
use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 查看器退出的最长等待时间
const VIEWER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// 采集状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CaptureStatus {
    /// 正在获取设备
    Pending,
    Live {
        source: String,
        width: u32,
        height: u32,
    },
    /// 获取失败，本次会话不再发送任何帧
    Failed { kind: String, message: String },
    Stopped,
}

impl CaptureStatus {
    fn failed(error: &CaptureError) -> Self {
        let kind = match error {
            CaptureError::PermissionDenied(_) => "permission_denied",
            CaptureError::DeviceUnavailable(_) => "device_unavailable",
            CaptureError::NotStarted => "not_started",
            CaptureError::Frame(_) => "frame",
        };
        CaptureStatus::Failed {
            kind: kind.to_string(),
            message: error.to_string(),
        }
    }
}

/// 状态页输出
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub server: String,
    pub connection: ConnectionState,
    pub capture: CaptureStatus,
    pub transport: TransportStatsSnapshot,
    pub scheduler: SchedulerStatsSnapshot,
    pub render: RenderStatsSnapshot,
}

/// 会话各部分状态的汇总
#[derive(Clone)]
pub struct StatusBoard {
    transport: Transport,
    capture: Arc<RwLock<CaptureStatus>>,
    scheduler: Arc<SchedulerStats>,
    render: Arc<RenderStats>,
}

impl StatusBoard {
    pub fn new(transport: Transport) -> Self {
        StatusBoard {
            transport,
            capture: Arc::new(RwLock::new(CaptureStatus::Pending)),
            scheduler: Arc::new(SchedulerStats::default()),
            render: Arc::new(RenderStats::default()),
        }
    }

    pub fn with_render_stats(mut self, render: Arc<RenderStats>) -> Self {
        self.render = render;
        self
    }

    pub fn scheduler_stats(&self) -> Arc<SchedulerStats> {
        self.scheduler.clone()
    }

    pub fn capture(&self) -> CaptureStatus {
        self.capture
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_capture(&self, status: CaptureStatus) {
        *self.capture.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            server: self.transport.url().to_string(),
            connection: self.transport.state(),
            capture: self.capture(),
            transport: self.transport.stats(),
            scheduler: self.scheduler.snapshot(),
            render: self.render.snapshot(),
        }
    }
}

/// 客户端应用
pub struct App {
    config: Config,
    preview: Surface,
    output: Surface,
    transport: Transport,
    renderer: ResultRenderer,
    status: StatusBoard,
}

impl App {
    pub fn new(config: Config) -> Self {
        let preview = Surface::new(config.capture.width, config.capture.height);
        let output = Surface::new(config.render.width, config.render.height);
        let transport = Transport::websocket(
            config.server.url.clone(),
            TransportConfig {
                reconnect_delay: config.server.reconnect_delay(),
            },
        );
        let renderer = ResultRenderer::new(
            Arc::new(JpegFrameDecoder),
            output.clone(),
            config.render.ordering,
        );
        let status = StatusBoard::new(transport.clone()).with_render_stats(renderer.stats());

        App {
            config,
            preview,
            output,
            transport,
            renderer,
            status,
        }
    }

    /// 本地预览表面
    pub fn preview(&self) -> &Surface {
        &self.preview
    }

    /// 处理结果输出表面
    pub fn output(&self) -> &Surface {
        &self.output
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// 运行会话直到 `shutdown_signal` 完成
    pub async fn run<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown_signal);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!("处理服务: {}", self.transport.url());
        tracing::info!(
            "发送周期: {:?}, 预览周期: {:?}",
            self.config.capture.tick_interval(),
            self.config.capture.preview_interval()
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let render_task = tokio::spawn(self.renderer.clone().run(inbound_rx));
        let transport_task = self.transport.start(inbound_tx);

        // 查看器先于采集启动，权限被拒绝时页面上能看到失败状态
        let viewer_task = if self.config.viewer.enabled {
            let viewer = WebViewer::new(
                self.config.viewer.bind.clone(),
                self.config.viewer.port,
                self.preview.clone(),
                self.output.clone(),
                self.status.clone(),
            );
            match viewer.start(shutdown_rx.clone()).await {
                Ok((_addr, handle)) => Some(handle),
                Err(e) => {
                    tracing::warn!("查看器启动失败，继续运行: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut source: Option<SharedSource> = None;
        let mut session_tasks: Vec<JoinHandle<()>> = Vec::new();

        tracing::info!("正在获取采集设备...");
        let acquired = tokio::select! {
            acquired = acquire_source(self.config.clone()) => Some(acquired),
            _ = &mut shutdown_signal => None,
        };

        let interrupted = acquired.is_none();
        match acquired {
            Some(Ok(started)) => {
                let (width, height) = started
                    .dimensions()
                    .unwrap_or((self.config.capture.width, self.config.capture.height));
                tracing::info!("采集源 {} 已就绪: {}x{}", started.name(), width, height);
                self.status.set_capture(CaptureStatus::Live {
                    source: started.name().to_string(),
                    width,
                    height,
                });
                self.preview.resize(width, height);

                let shared: SharedSource = Arc::new(Mutex::new(started));
                let scheduler = FrameScheduler::new(
                    shared.clone(),
                    Arc::new(JpegFrameEncoder::new(
                        self.config.capture.jpeg_quality,
                        self.config.capture.max_width,
                    )),
                    Arc::new(self.transport.clone()),
                    self.config.capture.tick_interval(),
                )
                .with_stats(self.status.scheduler_stats());

                session_tasks.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
                session_tasks.push(tokio::spawn(run_preview(
                    shared.clone(),
                    self.preview.clone(),
                    self.config.capture.preview_interval(),
                    shutdown_rx.clone(),
                )));
                source = Some(shared);
            }
            Some(Err(e)) => {
                tracing::error!("采集设备获取失败，本次会话不会发送任何帧: {}", e);
                self.status.set_capture(CaptureStatus::failed(&e));
            }
            None => {}
        }

        if !interrupted {
            shutdown_signal.await;
        }
        tracing::info!("正在停止...");

        // 1. 停止发送定时器和预览刷新
        shutdown_tx.send_replace(true);
        for task in session_tasks {
            let _ = task.await;
        }

        // 2. 关闭传输层，取消待执行的重连
        self.transport.shutdown();
        if let Err(e) = transport_task.await {
            tracing::error!("传输任务异常退出: {}", e);
        }

        // 3. 释放采集设备
        if let Some(shared) = source {
            let released = tokio::task::spawn_blocking(move || {
                shared.lock().unwrap_or_else(PoisonError::into_inner).stop();
            })
            .await;
            if let Err(e) = released {
                tracing::error!("释放采集设备失败: {}", e);
            }
            self.status.set_capture(CaptureStatus::Stopped);
        }

        // 4. 中止渲染器，未完成的解码一并取消
        render_task.abort();
        let _ = render_task.await;

        // 5. 停止查看器
        if let Some(handle) = viewer_task {
            if tokio::time::timeout(VIEWER_STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!("查看器停止超时");
            }
        }

        tracing::info!("已停止");
        Ok(())
    }
}

/// 在阻塞线程上创建并启动采集源
async fn acquire_source(config: Config) -> Result<Box<dyn CaptureSource>, CaptureError> {
    tokio::task::spawn_blocking(move || -> Result<Box<dyn CaptureSource>, CaptureError> {
        let mut source = create_source(&config.capture)?;
        source.start()?;
        Ok(source)
    })
    .await
    .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
}

/// 按预览周期把当前画面绘制到预览表面
async fn run_preview(
    source: SharedSource,
    surface: Surface,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let source = source.clone();
                let surface = surface.clone();
                let painted = tokio::task::spawn_blocking(move || {
                    let frame = source
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .current_frame()?;
                    surface.paint_rgb(frame.image());
                    Ok::<_, CaptureError>(())
                })
                .await;

                match painted {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!("预览帧读取失败: {}", e),
                    Err(e) => tracing::error!("预览任务异常退出: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
