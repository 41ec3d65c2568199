//! 本地回显处理服务
//!
//! 代替外部处理服务用于本地调试和集成测试: 在 `/ws` 上接受连接，
//! 解码每一帧，可选画一个标注框，重新编码后原样回传 `{ "frame": ... }`。
//! 同一连接内的帧按顺序处理

use crate::codec::{decode_jpeg, encode_jpeg, CodecError, DEFAULT_JPEG_QUALITY};
use crate::protocol::{FrameMessage, ProtocolError};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use image::{Rgb, RgbImage};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::Message;

/// 服务端点路径
pub const ENDPOINT_PATH: &str = "/ws";

/// 标注框颜色
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// 标注框线宽
const BOX_THICKNESS: u32 = 2;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// 处理选项
#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    /// 是否绘制标注框
    pub annotate: bool,
    /// 回传 JPEG 质量
    pub quality: u8,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            annotate: true,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// 回显处理服务
pub struct EchoProcessor {
    listener: TcpListener,
    options: ProcessorOptions,
}

impl EchoProcessor {
    pub async fn bind(addr: &str, options: ProcessorOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(EchoProcessor { listener, options })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("回显处理服务启动: ws://{}{}", self.local_addr()?, ENDPOINT_PATH);

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(stream, peer, self.options));
                    }
                    Err(e) => {
                        tracing::error!("接受连接失败: {}", e);
                    }
                },
                _ = shutdown.changed() => {
                    tracing::info!("回显处理服务关闭");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// 处理单个客户端连接
async fn handle_connection(stream: TcpStream, peer: SocketAddr, options: ProcessorOptions) {
    let ws_stream = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, "WebSocket 握手失败: {}", e);
            return;
        }
    };

    tracing::info!(%peer, "客户端连接");
    let (mut sender, mut receiver) = ws_stream.split();
    let mut processed: u64 = 0;

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%peer, "接收错误: {}", e);
                break;
            }
        };

        let reply = tokio::task::spawn_blocking(move || process_frame(&text, &options)).await;
        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(%peer, "跳过无效帧: {}", e);
                continue;
            }
            Err(e) => {
                tracing::error!(%peer, "处理任务异常退出: {}", e);
                continue;
            }
        };

        if let Err(e) = sender.send(Message::Text(reply)).await {
            tracing::debug!(%peer, "发送失败: {}", e);
            break;
        }
        processed += 1;
    }

    tracing::info!(%peer, processed, "客户端断开");
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == ENDPOINT_PATH {
        return Ok(response);
    }
    let mut error = ErrorResponse::new(Some(format!("unknown path {}", request.uri().path())));
    *error.status_mut() = StatusCode::NOT_FOUND;
    Err(error)
}

/// 处理一条入站消息，返回回传的 JSON 文本
pub fn process_frame(text: &str, options: &ProcessorOptions) -> Result<String, ProcessorError> {
    let message: FrameMessage = serde_json::from_str(text).map_err(ProtocolError::from)?;
    let encoded = message.into_encoded()?;
    let decoded = decode_jpeg(encoded.as_bytes())?;

    let mut image = image::DynamicImage::ImageRgba8(decoded.image).to_rgb8();
    if options.annotate {
        draw_box(&mut image);
    }

    let reply = encode_jpeg(&image, options.quality)?;
    Ok(FrameMessage::from_encoded(&reply).to_json()?)
}

/// 在画面中央一半区域画一个矩形框
fn draw_box(image: &mut RgbImage) {
    let (w, h) = image.dimensions();
    if w < BOX_THICKNESS * 2 || h < BOX_THICKNESS * 2 {
        return;
    }

    let (x0, y0) = (w / 4, h / 4);
    let (x1, y1) = ((w * 3 / 4).max(x0 + BOX_THICKNESS), (h * 3 / 4).max(y0 + BOX_THICKNESS));

    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x < x0 + BOX_THICKNESS
                || x >= x1 - BOX_THICKNESS
                || y < y0 + BOX_THICKNESS
                || y >= y1 - BOX_THICKNESS;
            if on_edge {
                image.put_pixel(x, y, BOX_COLOR);
            }
        }
    }
}
