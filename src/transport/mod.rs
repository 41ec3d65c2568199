//! 传输模块
//!
//! 维护到处理服务的持久双工连接:
//! - 连接断开后固定延迟重连，无限重试，不做指数退避
//! - 错误只记录日志，重连由随后的关闭触发
//! - 未打开时发送静默丢弃，不排队

pub mod connector;

pub use connector::{Connector, WsConnector, WsSink, WsStream};

use crate::protocol::{parse_inbound, EncodedFrame, FrameMessage};
use crate::scheduler::FrameSink;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tungstenite::Message;

/// 关闭连接时等待对端确认的最长时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 单帧写入的最长时间，超时视为发送失败
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// 一条连接的发送端，写入期间只锁住这一条连接
type SharedSink = Arc<Mutex<WsSink>>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// 传输配置
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// 每次关闭后到下一次连接尝试的固定延迟
    pub reconnect_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            reconnect_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
struct TransportStats {
    connect_attempts: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    frames_received: AtomicU64,
    malformed: AtomicU64,
}

/// 传输统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    pub connect_attempts: u64,
    pub opens: u64,
    pub closes: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub frames_received: u64,
    pub malformed: u64,
}

struct Inner {
    url: String,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    /// 当前连接的发送端，重连时整体替换。
    /// 外层锁只在取放时短暂持有，不跨越网络写入
    sink: std::sync::Mutex<Option<SharedSink>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    stats: TransportStats,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_sink(&self) -> Option<SharedSink> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace_sink(&self, sink: Option<SharedSink>) -> Option<SharedSink> {
        std::mem::replace(
            &mut *self.sink.lock().unwrap_or_else(PoisonError::into_inner),
            sink,
        )
    }
}

/// 可重连的传输层
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(url: impl Into<String>, config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        Transport {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                connector,
                sink: std::sync::Mutex::new(None),
                state,
                shutdown,
                stats: TransportStats::default(),
            }),
        }
    }

    /// 使用 WebSocket 连接器创建
    pub fn websocket(url: impl Into<String>, config: TransportConfig) -> Self {
        Self::new(url, config, Arc::new(WsConnector))
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// 启动连接监督任务，入站帧转发到 `inbound`
    pub fn start(&self, inbound: mpsc::UnboundedSender<EncodedFrame>) -> JoinHandle<()> {
        tokio::spawn(supervise(self.inner.clone(), inbound))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// 订阅连接状态变化
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// 发送一帧，返回是否已写入连接
    ///
    /// 连接未打开时静默丢弃；发送失败或超时只记录日志
    pub async fn send(&self, message: &FrameMessage) -> bool {
        if !self.is_open() {
            tracing::trace!("连接未打开，丢弃出站帧");
            return false;
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("出站帧序列化失败: {}", e);
                return false;
            }
        };

        let Some(sink) = self.inner.current_sink() else {
            return false;
        };

        let written = tokio::time::timeout(SEND_TIMEOUT, async {
            sink.lock().await.send(Message::Text(text)).await
        })
        .await;

        match written {
            Ok(Ok(())) => {
                self.inner.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                self.inner.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("发送失败: {}", e);
                false
            }
            Err(_) => {
                self.inner.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("发送超时 ({:?})，放弃本帧", SEND_TIMEOUT);
                false
            }
        }
    }

    /// 关闭传输层: 取消待执行的重连并关闭当前连接
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        let s = &self.inner.stats;
        TransportStatsSnapshot {
            connect_attempts: s.connect_attempts.load(Ordering::Relaxed),
            opens: s.opens.load(Ordering::Relaxed),
            closes: s.closes.load(Ordering::Relaxed),
            frames_sent: s.frames_sent.load(Ordering::Relaxed),
            send_failures: s.send_failures.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            malformed: s.malformed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl FrameSink for Transport {
    fn is_open(&self) -> bool {
        Transport::is_open(self)
    }

    async fn send(&self, message: FrameMessage) -> bool {
        Transport::send(self, &message).await
    }
}

/// 连接监督循环: Connecting -> Open -> Closed -> (延迟) -> Connecting ...
async fn supervise(inner: Arc<Inner>, inbound: mpsc::UnboundedSender<EncodedFrame>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        attempt += 1;
        inner.set_state(ConnectionState::Connecting);
        inner.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(attempt, url = %inner.url, "连接到处理服务");

        let connected = tokio::select! {
            result = inner.connector.connect(&inner.url) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((sink, stream)) => {
                inner.replace_sink(Some(Arc::new(Mutex::new(sink))));
                inner.set_state(ConnectionState::Open);
                inner.stats.opens.fetch_add(1, Ordering::Relaxed);
                tracing::info!(attempt, "连接成功");

                tokio::select! {
                    _ = receive_loop(&inner, stream, &inbound) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                tracing::error!(attempt, "连接失败: {}", e);
            }
        }

        // 不等待仍在写入的旧发送端，写入会因超时或连接断开自行结束
        inner.set_state(ConnectionState::Closed);
        inner.replace_sink(None);
        inner.stats.closes.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "连接已断开，{}ms 后重连",
            inner.config.reconnect_delay.as_millis()
        );

        tokio::select! {
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    if let Some(sink) = inner.replace_sink(None) {
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            sink.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("关闭连接时出错: {}", e),
            Err(_) => tracing::debug!("关闭连接超时"),
        }
    }
    inner.set_state(ConnectionState::Closed);
    tracing::info!("传输层已关闭");
}

/// 读取入站消息直到连接关闭或出错
async fn receive_loop(
    inner: &Inner,
    mut stream: WsStream,
    inbound: &mpsc::UnboundedSender<EncodedFrame>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_inbound(&text) {
                Ok(frame) => {
                    inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    if inbound.send(frame).is_err() {
                        tracing::debug!("渲染器已退出，丢弃入站帧");
                    }
                }
                Err(e) => {
                    inner.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("丢弃无效的入站消息: {}", e);
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!("服务端关闭连接: {:?}", frame);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("连接错误: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use tungstenite::Error as WsError;

    /// 模拟的服务端一侧
    struct Remote {
        to_client: mpsc::UnboundedSender<Result<Message, WsError>>,
        from_client: mpsc::UnboundedReceiver<Message>,
    }

    /// 记录每次连接尝试时间的连接器
    #[derive(Default)]
    struct ScriptedConnector {
        refuse: bool,
        /// 写入永不完成 (对端不再读取)
        stall_writes: bool,
        attempts: std::sync::Mutex<Vec<Instant>>,
        remotes: std::sync::Mutex<Vec<Remote>>,
    }

    impl ScriptedConnector {
        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn take_remote(&self) -> Remote {
            self.remotes.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<(WsSink, WsStream), WsError> {
            self.attempts.lock().unwrap().push(Instant::now());
            if self.refuse {
                return Err(WsError::ConnectionClosed);
            }

            let (to_client, client_rx) = mpsc::unbounded_channel();
            let (client_tx, from_client) = mpsc::unbounded_channel();
            self.remotes.lock().unwrap().push(Remote { to_client, from_client });

            let stall = self.stall_writes;
            let sink = futures_util::sink::unfold(
                client_tx,
                move |tx: mpsc::UnboundedSender<Message>, message: Message| async move {
                    if stall {
                        std::future::pending::<()>().await;
                    }
                    tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
                    Ok::<_, WsError>(tx)
                },
            );
            let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|message| (message, rx))
            });
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    fn transport(connector: Arc<ScriptedConnector>) -> Transport {
        Transport::new("ws://127.0.0.1:8000/ws", TransportConfig::default(), connector)
    }

    async fn wait_for_state(transport: &Transport, state: ConnectionState) {
        let mut rx = transport.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    fn frame_json(bytes: &[u8]) -> String {
        FrameMessage::from_encoded(&EncodedFrame::new(bytes.to_vec()))
            .to_json()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_fixed_delay() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;

        // 服务端在 t=0 关闭连接
        let closed_at = Instant::now();
        drop(connector.take_remote());
        wait_for_state(&transport, ConnectionState::Closed).await;

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(connector.attempts().len(), 1, "900ms 内不应重连");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        let waited = attempts[1] - closed_at;
        assert!(waited >= Duration::from_millis(1000) && waited < Duration::from_millis(1200));

        // 新连接保持打开，不会再次重连
        wait_for_state(&transport, ConnectionState::Open).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts().len(), 2);
        assert!(transport.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_retry_without_backoff() {
        let connector = Arc::new(ScriptedConnector {
            refuse: true,
            ..Default::default()
        });
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _task = transport.start(tx);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 5);
        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(1000) && gap < Duration::from_millis(1200));
        }
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert_eq!(transport.stats().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_close_schedules_one_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;

        let remote = connector.take_remote();
        remote.to_client.send(Err(WsError::AlreadyClosed)).unwrap();
        drop(remote);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(transport.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_send_is_noop_when_not_open() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());

        assert!(!transport.send(&FrameMessage { frame: "AQID".to_string() }).await);

        assert!(connector.attempts().is_empty());
        assert_eq!(transport.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;
        let mut remote = connector.take_remote();

        let outbound = FrameMessage::from_encoded(&EncodedFrame::new(vec![9, 8, 7]));
        assert!(FrameSink::send(&transport, outbound.clone()).await);
        match remote.from_client.recv().await {
            Some(Message::Text(text)) => {
                let parsed: FrameMessage = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed, outbound);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // 无效消息被丢弃，连接保持打开
        remote.to_client.send(Ok(Message::Text("{oops".to_string()))).unwrap();
        remote
            .to_client
            .send(Ok(Message::Text(frame_json(&[1, 2, 3]))))
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.as_bytes(), &[1, 2, 3]);
        assert!(transport.is_open());

        let stats = transport.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_does_not_block_reconnect() {
        let connector = Arc::new(ScriptedConnector {
            stall_writes: true,
            ..Default::default()
        });
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;
        let remote = connector.take_remote();

        let sender = transport.clone();
        let pending_send = tokio::spawn(async move {
            sender
                .send(&FrameMessage::from_encoded(&EncodedFrame::new(vec![1, 2, 3])))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 写入卡住时对端关闭连接
        let closed_at = Instant::now();
        remote.to_client.send(Ok(Message::Close(None))).unwrap();
        drop(remote);
        wait_for_state(&transport, ConnectionState::Closed).await;
        assert!(Instant::now() - closed_at < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        let waited = attempts[1] - closed_at;
        assert!(waited >= Duration::from_millis(1000) && waited < Duration::from_millis(1200));
        assert_eq!(transport.stats().closes, 1);

        // 卡住的写入在超时后放弃，并报告未发送
        assert!(!pending_send.await.unwrap());
        assert_eq!(transport.stats().send_failures, 1);
        assert_eq!(transport.stats().frames_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;

        drop(connector.take_remote());
        wait_for_state(&transport, ConnectionState::Closed).await;

        transport.shutdown();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connection() {
        let connector = Arc::new(ScriptedConnector::default());
        let transport = transport(connector.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = transport.start(tx);
        wait_for_state(&transport, ConnectionState::Open).await;
        let mut remote = connector.take_remote();

        transport.shutdown();
        task.await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(remote.from_client.recv().await.is_none());
    }
}
