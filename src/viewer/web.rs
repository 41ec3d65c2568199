//! Web 查看器实现
//!
//! 启动本地 HTTP 服务器，展示本地预览与处理结果两个画面以及运行状态

use crate::app::StatusBoard;
use crate::render::Surface;
use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 快照 JPEG 质量
const SNAPSHOT_QUALITY: u8 = 85;

#[derive(Clone)]
struct ViewerState {
    preview: Surface,
    output: Surface,
    status: StatusBoard,
}

/// Web 查看器
pub struct WebViewer {
    bind: String,
    port: u16,
    state: ViewerState,
}

impl WebViewer {
    /// 创建新的 Web 查看器
    pub fn new(bind: String, port: u16, preview: Surface, output: Surface, status: StatusBoard) -> Self {
        Self {
            bind,
            port,
            state: ViewerState {
                preview,
                output,
                status,
            },
        }
    }

    /// 启动 HTTP 服务器，返回实际监听地址
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<(SocketAddr, JoinHandle<()>)> {
        let app = Router::new()
            .route("/", get(|| async { Html(VIEWER_HTML) }))
            .route("/preview.jpg", get(preview_snapshot))
            .route("/output.jpg", get(output_snapshot))
            .route("/status", get(status))
            .with_state(self.state.clone());

        let addr: SocketAddr = format!("{}:{}", self.bind, self.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                tracing::error!("查看器服务异常退出: {}", e);
            }
        });

        tracing::info!("查看器已启动: http://{}", local_addr);
        Ok((local_addr, handle))
    }
}

async fn preview_snapshot(State(state): State<ViewerState>) -> Response {
    jpeg_response(state.preview).await
}

async fn output_snapshot(State(state): State<ViewerState>) -> Response {
    jpeg_response(state.output).await
}

async fn status(State(state): State<ViewerState>) -> Response {
    Json(state.status.report()).into_response()
}

async fn jpeg_response(surface: Surface) -> Response {
    match tokio::task::spawn_blocking(move || surface.to_jpeg(SNAPSHOT_QUALITY)).await {
        Ok(Ok(bytes)) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

const VIEWER_HTML: &str = r#"<!DOCTYPE html>
<html lang="zh-CN">
<head>
    <meta charset="UTF-8">
    <title>handstream - 实时手部检测</title>
    <style>
        body { background: #1a1a2e; color: #eee; font-family: sans-serif; margin: 0; padding: 20px; }
        h1 { font-size: 18px; font-weight: 500; }
        .surfaces { display: flex; gap: 20px; flex-wrap: wrap; }
        .surface img { width: 100%; max-width: 640px; border: 1px solid #0f3460; background: #000; }
        #status { font-family: monospace; font-size: 13px; white-space: pre; margin-top: 16px; }
        .error { color: #ff6b6b; }
    </style>
</head>
<body>
    <h1>实时手部检测</h1>
    <div class="surfaces">
        <div class="surface"><div>本地预览</div><img id="preview" alt="preview"></div>
        <div class="surface"><div>处理结果</div><img id="output" alt="output"></div>
    </div>
    <div id="status"></div>
    <script>
        function refresh(id, url) {
            const img = document.getElementById(id);
            const next = new Image();
            next.onload = () => { img.src = next.src; setTimeout(() => refresh(id, url), 100); };
            next.onerror = () => setTimeout(() => refresh(id, url), 1000);
            next.src = url + '?t=' + Date.now();
        }
        async function pollStatus() {
            const el = document.getElementById('status');
            try {
                const status = await (await fetch('/status')).json();
                el.className = status.capture.state === 'failed' ? 'error' : '';
                el.textContent = JSON.stringify(status, null, 2);
            } catch (e) {
                el.className = 'error';
                el.textContent = '无法获取状态';
            }
            setTimeout(pollStatus, 1000);
        }
        refresh('preview', '/preview.jpg');
        refresh('output', '/output.jpg');
        pollStatus();
    </script>
</body>
</html>
"#;
