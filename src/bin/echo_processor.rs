//! handstream 回显处理服务
//!
//! 本地调试用的处理服务替身: 接收帧，画标注框后原样回传
//!
//! # 运行方式
//!
//! ```bash
//! # 默认监听 127.0.0.1:8000，端点 /ws
//! handstream-echo
//!
//! # 不画标注框，降低回传质量
//! handstream-echo --bind 0.0.0.0:8000 --no-annotate --quality 70
//! ```

use anyhow::Result;
use clap::Parser;
use handstream::processor::{EchoProcessor, ProcessorOptions};
use tokio::sync::watch;

/// 回显处理服务命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000", env = "HANDSTREAM_ECHO_BIND")]
    bind: String,

    /// 不绘制标注框
    #[arg(long)]
    no_annotate: bool,

    /// 回传 JPEG 质量 (1-100)
    #[arg(long, default_value = "92", value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let options = ProcessorOptions {
        annotate: !args.no_annotate,
        quality: args.quality,
    };
    let processor = EchoProcessor::bind(&args.bind, options).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到退出信号");
        }
        shutdown_tx.send_replace(true);
    });

    processor.run(shutdown_rx).await
}
