//! 帧调度模块
//!
//! 固定周期驱动 "采集 -> 编码 -> 发送"。连接未打开或上一帧仍在途时，
//! 本次 tick 直接丢帧，从不排队，在途帧数上限为 1

pub mod slot;

pub use slot::{InFlightSlot, InFlightToken};

use crate::capture::{CaptureError, CaptureSource};
use crate::codec::{CodecError, FrameEncoder};
use crate::protocol::{EncodedFrame, FrameMessage};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 统计日志输出周期
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// 共享的采集源
pub type SharedSource = Arc<Mutex<Box<dyn CaptureSource>>>;

/// 出站帧的接收方 (由 Transport 实现)
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// 连接是否处于 Open 状态
    fn is_open(&self) -> bool;

    /// 发送一帧，返回是否已写入连接；未打开时静默丢弃
    async fn send(&self, message: FrameMessage) -> bool;
}

/// 单次 tick 的结果
#[derive(Debug)]
pub enum TickOutcome {
    /// 已占用槽位并派发发送任务
    Dispatched(JoinHandle<()>),
    /// 连接未打开，丢帧
    NotOpen,
    /// 上一帧仍在途，丢帧
    InFlight,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// 调度统计
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    sent: AtomicU64,
    dropped_not_open: AtomicU64,
    dropped_in_flight: AtomicU64,
    failed: AtomicU64,
    unsent: AtomicU64,
}

/// 调度统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub sent: u64,
    pub dropped_not_open: u64,
    pub dropped_in_flight: u64,
    pub failed: u64,
    /// 已编码但未写入连接 (发送前连接关闭或写入失败)
    pub unsent: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped_not_open: self.dropped_not_open.load(Ordering::Relaxed),
            dropped_in_flight: self.dropped_in_flight.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unsent: self.unsent.load(Ordering::Relaxed),
        }
    }
}

/// 帧调度器
pub struct FrameScheduler {
    source: SharedSource,
    encoder: Arc<dyn FrameEncoder>,
    sink: Arc<dyn FrameSink>,
    slot: InFlightSlot,
    interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl FrameScheduler {
    pub fn new(
        source: SharedSource,
        encoder: Arc<dyn FrameEncoder>,
        sink: Arc<dyn FrameSink>,
        interval: Duration,
    ) -> Self {
        FrameScheduler {
            source,
            encoder,
            sink,
            slot: InFlightSlot::new(),
            interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// 使用外部统计 (状态页在调度器创建前就需要引用它)
    pub fn with_stats(mut self, stats: Arc<SchedulerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn slot(&self) -> &InFlightSlot {
        &self.slot
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// 执行一次调度
    ///
    /// 必须在 tokio 运行时内调用
    pub fn tick(&self) -> TickOutcome {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        if !self.sink.is_open() {
            self.stats.dropped_not_open.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("连接未打开，跳过本帧");
            return TickOutcome::NotOpen;
        }

        let Some(token) = self.slot.try_claim() else {
            self.stats.dropped_in_flight.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("上一帧仍在发送，丢弃本帧");
            return TickOutcome::InFlight;
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(send_frame(
            token,
            self.source.clone(),
            self.encoder.clone(),
            self.sink.clone(),
            self.stats.clone(),
        ));
        TickOutcome::Dispatched(handle)
    }

    /// 按固定周期运行，直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(STATS_REPORT_INTERVAL);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        report.tick().await;

        let mut in_flight: Option<JoinHandle<()>> = None;
        tracing::info!("帧调度器启动，周期 {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let TickOutcome::Dispatched(handle) = self.tick() {
                        in_flight = Some(handle);
                    }
                }
                _ = report.tick() => {
                    let s = self.stats.snapshot();
                    tracing::info!(
                        ticks = s.ticks,
                        sent = s.sent,
                        dropped_not_open = s.dropped_not_open,
                        dropped_in_flight = s.dropped_in_flight,
                        failed = s.failed,
                        unsent = s.unsent,
                        "发送统计"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }

        if let Some(handle) = in_flight.take() {
            handle.abort();
        }
        tracing::info!("帧调度器已停止");
    }
}

/// 采集、编码并发送一帧；令牌在函数结束时释放
async fn send_frame(
    token: InFlightToken,
    source: SharedSource,
    encoder: Arc<dyn FrameEncoder>,
    sink: Arc<dyn FrameSink>,
    stats: Arc<SchedulerStats>,
) {
    let encoded = tokio::task::spawn_blocking(move || -> Result<EncodedFrame, AttemptError> {
        // 每次重新读取当前画面，分辨率变化自动跟随
        let frame = source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_frame()?;
        Ok(encoder.encode(&frame)?)
    })
    .await;

    match encoded {
        Ok(Ok(frame)) => {
            if sink.send(FrameMessage::from_encoded(&frame)).await {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(bytes = frame.len(), "帧已发送");
            } else {
                stats.unsent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("帧未能写入连接");
            }
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("帧处理失败: {}", e);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!("编码任务异常退出: {}", e);
        }
    }

    drop(token);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PatternSource;
    use crate::codec::{decode_jpeg, JpegFrameEncoder};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    /// 记录发送的假连接
    #[derive(Default)]
    struct SpySink {
        open: AtomicBool,
        sent: Mutex<Vec<FrameMessage>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Option<Duration>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
        /// 模拟写入失败
        reject: bool,
    }

    impl SpySink {
        fn open() -> Self {
            SpySink {
                open: AtomicBool::new(true),
                ..Default::default()
            }
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FrameSink for SpySink {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, message: FrameMessage) -> bool {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.reject {
                return false;
            }
            self.sent.lock().unwrap().push(message);
            true
        }
    }

    fn started_source(width: u32, height: u32) -> SharedSource {
        let mut source = PatternSource::new(width, height);
        source.start().unwrap();
        let boxed: Box<dyn CaptureSource> = Box::new(source);
        Arc::new(Mutex::new(boxed))
    }

    fn scheduler(source: SharedSource, sink: Arc<SpySink>, interval: Duration) -> FrameScheduler {
        FrameScheduler::new(source, Arc::new(JpegFrameEncoder::default()), sink, interval)
    }

    #[tokio::test]
    async fn test_no_send_when_not_open() {
        let sink = Arc::new(SpySink::default());
        let scheduler = scheduler(started_source(64, 48), sink.clone(), Duration::from_millis(300));

        for _ in 0..10 {
            assert!(matches!(scheduler.tick(), TickOutcome::NotOpen));
        }

        assert_eq!(sink.sent_count(), 0);
        assert_eq!(scheduler.slot().claims(), 0);
        let stats = scheduler.stats().snapshot();
        assert_eq!(stats.ticks, 10);
        assert_eq!(stats.dropped_not_open, 10);
    }

    #[tokio::test]
    async fn test_tick_sends_native_resolution_jpeg() {
        let sink = Arc::new(SpySink::open());
        let scheduler = scheduler(started_source(320, 240), sink.clone(), Duration::from_millis(300));

        match scheduler.tick() {
            TickOutcome::Dispatched(handle) => handle.await.unwrap(),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let message = sink.sent.lock().unwrap().pop().unwrap();
        let encoded = message.into_encoded().unwrap();
        let decoded = decode_jpeg(encoded.as_bytes()).unwrap();
        assert_eq!((decoded.width, decoded.height), (320, 240));
        assert!(!scheduler.slot().is_held());
    }

    #[tokio::test]
    async fn test_tick_dropped_while_in_flight() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let sink = Arc::new(SpySink {
            open: AtomicBool::new(true),
            gate: Some((entered.clone(), release.clone())),
            ..Default::default()
        });
        let scheduler = scheduler(started_source(64, 48), sink.clone(), Duration::from_millis(300));

        let TickOutcome::Dispatched(first) = scheduler.tick() else {
            panic!("first tick should dispatch");
        };
        entered.notified().await;

        // 慢发送期间到来的 tick 被丢弃，且不报错
        assert!(matches!(scheduler.tick(), TickOutcome::InFlight));
        assert!(matches!(scheduler.tick(), TickOutcome::InFlight));
        assert_eq!(scheduler.stats().snapshot().dropped_in_flight, 2);

        release.notify_one();
        first.await.unwrap();
        assert_eq!(sink.sent_count(), 1);
        assert!(!scheduler.slot().is_held());

        let TickOutcome::Dispatched(second) = scheduler.tick() else {
            panic!("slot should be free again");
        };
        entered.notified().await;
        release.notify_one();
        second.await.unwrap();
        assert_eq!(sink.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_releases_slot() {
        // 未启动的采集源，采集必然失败
        let boxed: Box<dyn CaptureSource> = Box::new(PatternSource::new(64, 48));
        let source: SharedSource = Arc::new(Mutex::new(boxed));
        let sink = Arc::new(SpySink::open());
        let scheduler = scheduler(source, sink.clone(), Duration::from_millis(300));

        let TickOutcome::Dispatched(handle) = scheduler.tick() else {
            panic!("tick should dispatch");
        };
        handle.await.unwrap();

        assert_eq!(sink.sent_count(), 0);
        assert_eq!(scheduler.stats().snapshot().failed, 1);
        assert!(!scheduler.slot().is_held());
        assert!(matches!(scheduler.tick(), TickOutcome::Dispatched(_)));
    }

    #[tokio::test]
    async fn test_rejected_send_is_not_counted_as_sent() {
        let sink = Arc::new(SpySink {
            open: AtomicBool::new(true),
            reject: true,
            ..Default::default()
        });
        let scheduler = scheduler(started_source(64, 48), sink.clone(), Duration::from_millis(300));

        let TickOutcome::Dispatched(handle) = scheduler.tick() else {
            panic!("tick should dispatch");
        };
        handle.await.unwrap();

        let stats = scheduler.stats().snapshot();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.unsent, 1);
        assert_eq!(stats.failed, 0);
        assert!(!scheduler.slot().is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_keeps_single_flight() {
        let sink = Arc::new(SpySink {
            open: AtomicBool::new(true),
            delay: Some(Duration::from_millis(25)),
            ..Default::default()
        });
        let scheduler = scheduler(started_source(64, 48), sink.clone(), Duration::from_millis(5));
        let slot = scheduler.slot().clone();
        let stats = scheduler.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
        assert!(sink.sent_count() >= 1);
        assert!(stats.snapshot().dropped_in_flight > 0);
        assert!(!slot.is_held());
        assert_eq!(slot.claims(), slot.releases());
    }
}
