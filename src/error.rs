//! 错误类型定义

use std::path::PathBuf;

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 监听根路径在启动时缺失或不可访问（致命，不在内部重试）
    #[error("监听初始化失败: {path:?}: {message}")]
    WatchSetup { path: PathBuf, message: String },

    /// 运行期监听失败（按 root 隔离，经由事件上报）
    #[error("监听运行错误: {0}")]
    WatchRuntime(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 传输错误（连接断开 / 握手失败）
    #[error("传输错误: {0}")]
    Transport(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
