//! 本地查看器模块

pub mod web;

pub use web::WebViewer;
