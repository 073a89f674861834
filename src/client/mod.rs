//! Viewer 侧客户端模块
//!
//! 订阅 Relay 的 SSE 事件流，断线自动重连

mod connect;

pub use connect::{backoff_delay, CloseCallback, EventCallback, StreamClient, StreamClientConfig};
