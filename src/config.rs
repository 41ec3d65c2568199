//! 配置管理模块
//!
//! 负责加载和管理应用程序配置

use crate::render::RenderOrdering;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 应用程序配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 处理服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// WebSocket 端点地址
    #[serde(default = "default_server_url")]
    pub url: String,
    /// 断开后重连延迟 (毫秒，固定不退避)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// 采集源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 合成测试图案
    Pattern,
    /// 本地摄像头 (需要 webcam feature)
    Camera,
}

/// 采集与发送配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,
    /// 摄像头索引
    #[serde(default)]
    pub device_index: u32,
    /// 请求的采集宽度
    #[serde(default = "default_width")]
    pub width: u32,
    /// 请求的采集高度
    #[serde(default = "default_height")]
    pub height: u32,
    /// 发送周期 (毫秒)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 本地预览刷新周期 (毫秒)
    #[serde(default = "default_preview_interval_ms")]
    pub preview_interval_ms: u64,
    /// JPEG 质量 (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// 发送前缩放到的最大宽度 (None = 原始宽度)
    #[serde(default)]
    pub max_width: Option<u32>,
}

/// 结果渲染配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// 输出画布宽度
    #[serde(default = "default_width")]
    pub width: u32,
    /// 输出画布高度
    #[serde(default = "default_height")]
    pub height: u32,
    /// 解码完成顺序策略
    #[serde(default)]
    pub ordering: RenderOrdering,
}

/// 本地查看器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_viewer_bind")]
    pub bind: String,
    #[serde(default = "default_viewer_port")]
    pub port: u16,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            url: default_server_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            source: default_source(),
            device_index: 0,
            width: default_width(),
            height: default_height(),
            tick_interval_ms: default_tick_interval_ms(),
            preview_interval_ms: default_preview_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
            max_width: None,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            width: default_width(),
            height: default_height(),
            ordering: RenderOrdering::default(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            enabled: true,
            bind: default_viewer_bind(),
            port: default_viewer_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8000/ws".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_source() -> SourceKind {
    if cfg!(feature = "webcam") {
        SourceKind::Camera
    } else {
        SourceKind::Pattern
    }
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_tick_interval_ms() -> u64 {
    300
}

fn default_preview_interval_ms() -> u64 {
    66
}

fn default_jpeg_quality() -> u8 {
    92
}

fn default_true() -> bool {
    true
}

fn default_viewer_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_viewer_port() -> u16 {
    8081
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl CaptureConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }
}

impl Config {
    /// 从文件加载配置
    ///
    /// 如果文件不存在，返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("配置文件不存在: {:?}, 使用默认配置", path);
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("配置文件解析失败: {}", e))?;

        tracing::info!("配置加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server.url)
            .map_err(|e| anyhow::anyhow!("无效的服务器地址 {}: {}", self.server.url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("服务器地址必须使用 ws:// 或 wss://: {}", self.server.url);
        }
        if self.capture.tick_interval_ms == 0 {
            bail!("capture.tick_interval_ms 必须大于 0");
        }
        if self.capture.preview_interval_ms == 0 {
            bail!("capture.preview_interval_ms 必须大于 0");
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            bail!("capture.jpeg_quality 必须在 1-100 之间");
        }
        if self.capture.max_width == Some(0) {
            bail!("capture.max_width 必须大于 0");
        }
        if self.render.width == 0 || self.render.height == 0 {
            bail!("render 画布尺寸必须大于 0");
        }
        Ok(())
    }

    /// 获取配置文件路径
    ///
    /// 优先级: 命令行指定 > 当前目录 > 用户主目录
    pub fn get_config_path(cli_path: Option<&str>) -> String {
        if let Some(p) = cli_path {
            return p.to_string();
        }

        if Path::new("handstream.toml").exists() {
            return "handstream.toml".to_string();
        }

        if let Ok(home) = std::env::var("HOME") {
            let config_path = format!("{}/.config/handstream/config.toml", home);
            if Path::new(&config_path).exists() {
                return config_path;
            }
        }

        "handstream.toml".to_string()
    }
}
