//! handstream - 无界面的摄像头推流客户端
//!
//! 按固定周期采集摄像头画面，编码为 JPEG 后经 WebSocket 发送给远端处理服务，
//! 并把处理服务回传的标注画面渲染到输出表面

pub mod app;
pub mod capture;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod render;
pub mod scheduler;
pub mod transport;

// 本地回显处理服务 (调试和集成测试用)
pub mod processor;

// Web 查看器模块
pub mod viewer;
