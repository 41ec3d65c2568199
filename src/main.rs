//! handstream - 无界面的摄像头推流客户端
//!
//! 主入口程序

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Args, Commands};
use handstream::app::App;
use handstream::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    if let Some(Commands::Config { path }) = &args.command {
        Config::default().save(path)?;
        println!("已生成配置文件: {}", path);
        return Ok(());
    }

    let config_path = Config::get_config_path(args.config.as_deref());
    let mut config = Config::load(&config_path)?;
    apply_overrides(&mut config, &args);

    init_logging(args.verbose, &config.logging.level);
    config.validate()?;

    info!("handstream v{} 启动中...", env!("CARGO_PKG_VERSION"));
    info!("配置文件: {}", config_path);

    App::new(config)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("监听退出信号失败: {}", e);
                std::future::pending::<()>().await;
            }
            info!("收到退出信号");
        })
        .await
}

/// 命令行参数覆盖配置
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(server) = &args.server {
        config.server.url = server.clone();
    }
    if let Some(tick_ms) = args.tick_ms {
        config.capture.tick_interval_ms = tick_ms;
    }
    if let Some(source) = args.source {
        config.capture.source = source.into();
    }
    if let Some(device) = args.device {
        config.capture.device_index = device;
    }
    if let Some(port) = args.viewer_port {
        config.viewer.port = port;
    }
    if args.no_viewer {
        config.viewer.enabled = false;
    }
}

/// 初始化日志
///
/// 优先级: RUST_LOG > -v > 配置文件
fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
}
