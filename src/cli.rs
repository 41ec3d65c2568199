//! CLI argument definitions for handstream
//!
//! This module contains all command-line argument parsing logic.

use clap::{Parser, Subcommand};
use handstream::config::SourceKind;

/// handstream - 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 处理服务 WebSocket 地址
    #[arg(short, long, env = "HANDSTREAM_SERVER")]
    pub server: Option<String>,

    /// 发送周期 (毫秒)
    #[arg(short, long)]
    pub tick_ms: Option<u64>,

    /// 采集源 (pattern/camera)
    #[arg(long, value_enum)]
    pub source: Option<SourceArg>,

    /// 摄像头索引
    #[arg(short = 'i', long)]
    pub device: Option<u32>,

    /// 查看器端口
    #[arg(long)]
    pub viewer_port: Option<u16>,

    /// 禁用本地查看器
    #[arg(long)]
    pub no_viewer: bool,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// 采集源参数
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum SourceArg {
    Pattern,
    Camera,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Pattern => SourceKind::Pattern,
            SourceArg::Camera => SourceKind::Camera,
        }
    }
}

/// 子命令
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行推流客户端 (默认)
    Run,

    /// 生成配置文件
    Config {
        /// 配置文件路径
        #[arg(short, long, default_value = "handstream.toml")]
        path: String,
    },
}
