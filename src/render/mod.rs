//! 结果渲染模块
//!
//! 每条入站帧启动一个异步解码任务，解码完成即绘制到输出表面。
//! 解码可以并发进行，完成顺序不一定等于到达顺序

pub mod surface;

pub use surface::Surface;

use crate::codec::FrameDecoder;
use crate::protocol::EncodedFrame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// 解码完成后的绘制策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderOrdering {
    /// 最后完成的解码覆盖画面，与到达顺序无关
    #[default]
    LastDecode,
    /// 按本地到达序号，丢弃比已绘制帧更早到达的解码结果
    LastArrival,
}

/// 渲染统计
#[derive(Debug, Default)]
pub struct RenderStats {
    received: AtomicU64,
    painted: AtomicU64,
    decode_failed: AtomicU64,
    discarded: AtomicU64,
}

/// 渲染统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStatsSnapshot {
    pub received: u64,
    pub painted: u64,
    pub decode_failed: u64,
    pub discarded: u64,
}

impl RenderStats {
    pub fn snapshot(&self) -> RenderStatsSnapshot {
        RenderStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            painted: self.painted.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// 结果渲染器
#[derive(Clone)]
pub struct ResultRenderer {
    decoder: Arc<dyn FrameDecoder>,
    target: Surface,
    ordering: RenderOrdering,
    newest_painted: Arc<Mutex<u64>>,
    stats: Arc<RenderStats>,
}

impl ResultRenderer {
    pub fn new(decoder: Arc<dyn FrameDecoder>, target: Surface, ordering: RenderOrdering) -> Self {
        ResultRenderer {
            decoder,
            target,
            ordering,
            newest_painted: Arc::new(Mutex::new(0)),
            stats: Arc::new(RenderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        self.stats.clone()
    }

    pub fn target(&self) -> &Surface {
        &self.target
    }

    /// 消费入站帧直到通道关闭
    ///
    /// 解码任务归属于本 future，future 被丢弃或中止时未完成的解码一并取消
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<EncodedFrame>) {
        let mut decodes = JoinSet::new();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        sequence += 1;
                        self.stats.received.fetch_add(1, Ordering::Relaxed);
                        let renderer = self.clone();
                        decodes.spawn(async move {
                            renderer.render(sequence, frame).await;
                        });
                    }
                    None => break,
                },
                Some(joined) = decodes.join_next(), if !decodes.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("解码任务异常退出: {}", e);
                        }
                    }
                }
            }
        }

        while decodes.join_next().await.is_some() {}
        tracing::debug!("入站通道已关闭，渲染器退出");
    }

    /// 解码并绘制一帧，返回是否已绘制
    pub async fn render(&self, sequence: u64, frame: EncodedFrame) -> bool {
        let decoded = match self.decoder.decode(frame).await {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.decode_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, "入站帧解码失败，已丢弃: {}", e);
                return false;
            }
        };

        // 缩放在阻塞线程池中完成，绘制时尺寸一致只做拷贝
        let target = self.target.clone();
        let scaled = match tokio::task::spawn_blocking(move || target.fit(decoded.image)).await {
            Ok(scaled) => scaled,
            Err(e) => {
                self.stats.decode_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(sequence, "缩放任务异常退出: {}", e);
                return false;
            }
        };

        let mut newest = self
            .newest_painted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.ordering == RenderOrdering::LastArrival && sequence < *newest {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sequence, newest = *newest, "丢弃过期的解码结果");
            return false;
        }
        *newest = (*newest).max(sequence);

        let (width, height) = (decoded.width, decoded.height);
        self.target.paint(&scaled);
        self.stats.painted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(sequence, width, height, "已绘制");
        true
    }
}
