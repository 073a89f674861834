//! ai-cli-session-relay - 会话变更实时转发
//!
//! 监听 AI CLI 工具落盘的会话数据（history 单文件、projects 转录树、
//! teams 状态树），把文件变化按逻辑数据源分类后经 SSE 实时推送给
//! 所有在线 viewer。
//!
//! # 核心功能
//!
//! - **路径分类**: 绝对路径 → sessions / projects / teams
//! - **文件监听**: notify 封装，启动全量扫描 + 过滤降噪
//! - **事件广播**: 变更 → 广播事件的确定性映射 + 多连接扇出
//! - **自动重连**: viewer 侧指数退避，提前注册的监听不丢失
//!
//! # Feature Flags
//!
//! - `relay`: Relay 服务端（文件监听 + SSE 推送）
//! - `client`: Viewer 侧客户端（SSE 订阅 + 自动重连）
//!
//! # 语义边界
//!
//! 事件是尽力投递：不持久化、不回放，断线窗口内的广播按约定丢失。
//! 转录内容的解析/存储/查询属于上层应用，这里只做变更分发。

pub mod classifier;
pub mod config;
pub mod error;
pub mod protocol;

#[cfg(feature = "relay")]
pub mod relay;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use classifier::{normalize_path, PathClassifier};
pub use config::RelayConfig;
pub use error::{Error, Result};
pub use protocol::{
    BroadcastEvent, ChangeEvent, ChangeKind, ConnectionState, SourceCategory, StreamMessage,
};

#[cfg(feature = "relay")]
pub use relay::{ChangeWatcher, EventBus, RelayServer, StreamHub, WatcherEvent};

#[cfg(feature = "client")]
pub use client::{CloseCallback, EventCallback, StreamClient, StreamClientConfig};
