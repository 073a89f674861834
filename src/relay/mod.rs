//! Relay 模块 - 文件监听 + 变更分类 + SSE 推送
//!
//! Relay 是会话数据的唯一观察者，负责：
//! - 监听 AI CLI 会话文件变化（history / projects / teams 三个 root）
//! - 把文件系统事件映射为带分类的广播事件
//! - 经 SSE 长连接扇出给所有在线 viewer

mod bus;
mod hub;
mod server;
mod watcher;

pub use bus::EventBus;
pub use hub::{ConnId, MessageSender, StreamHub};
pub use server::RelayServer;
pub use watcher::{ChangeWatcher, WatcherEvent};
