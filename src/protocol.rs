//! 线路协议模块
//!
//! 双向 JSON 消息: `{ "frame": "<base64 JPEG>" }`，两个方向结构相同，
//! 没有序列号、时间戳或版本字段

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// 协议错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Empty frame payload")]
    EmptyFrame,
}

/// 编码后的静态图像 (JPEG)
///
/// 一经生成不可修改，克隆只增加引用计数
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    data: Arc<[u8]>,
}

impl EncodedFrame {
    pub fn new(data: Vec<u8>) -> Self {
        EncodedFrame { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("len", &self.data.len())
            .finish()
    }
}

/// 线路消息信封 (出站/入站相同)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// base64 图像数据，不带 data-URI 前缀
    pub frame: String,
}

impl FrameMessage {
    /// 由编码帧构造出站消息
    pub fn from_encoded(frame: &EncodedFrame) -> Self {
        FrameMessage {
            frame: STANDARD.encode(frame.as_bytes()),
        }
    }

    /// 序列化为 JSON 文本
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解码信封中的图像数据
    pub fn into_encoded(self) -> Result<EncodedFrame, ProtocolError> {
        let payload = strip_data_uri(self.frame.trim());
        if payload.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        let data = STANDARD.decode(payload)?;
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        Ok(EncodedFrame::new(data))
    }
}

/// 解析入站文本消息
pub fn parse_inbound(text: &str) -> Result<EncodedFrame, ProtocolError> {
    let message: FrameMessage = serde_json::from_str(text)?;
    message.into_encoded()
}

/// 去掉可能存在的 `data:image/jpeg;base64,` 前缀
fn strip_data_uri(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, rest)) = payload.split_once(";base64,") {
            return rest;
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_envelope_shape() {
        let frame = EncodedFrame::new(vec![0xFF, 0xD8, 0xFF, 0xE0]);
        let json = FrameMessage::from_encoded(&frame).to_json().unwrap();
        assert_eq!(json, r#"{"frame":"/9j/4A=="}"#);
    }

    #[test]
    fn test_parse_inbound() {
        let frame = parse_inbound(r#"{"frame":"/9j/4A=="}"#).unwrap();
        assert_eq!(frame.as_bytes(), &[0xFF, 0xD8, 0xFF, 0xE0]);
    }

    #[test]
    fn test_parse_inbound_strips_data_uri() {
        let frame = parse_inbound(r#"{"frame":"data:image/jpeg;base64,/9j/4A=="}"#).unwrap();
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn test_parse_inbound_ignores_unknown_fields() {
        let frame = parse_inbound(r#"{"frame":"AQID","label":"hand"}"#).unwrap();
        assert_eq!(frame.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_malformed_inbound() {
        assert!(matches!(parse_inbound("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(parse_inbound(r#"{"image":"AQID"}"#), Err(ProtocolError::Json(_))));
        assert!(matches!(parse_inbound(r#"{"frame":"@@@"}"#), Err(ProtocolError::Base64(_))));
        assert!(matches!(parse_inbound(r#"{"frame":""}"#), Err(ProtocolError::EmptyFrame)));
    }
}
