//! 连接器
//!
//! 打开一条双工连接，返回拆分后的发送端与接收端

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tungstenite::{Error as WsError, Message};

/// 连接发送端
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// 连接接收端
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// 连接器 trait
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), WsError>;
}

/// WebSocket 连接器
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), WsError> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (sink, stream) = ws_stream.split();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
