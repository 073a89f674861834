//! vimo-relay - AI CLI 会话变更转发服务
//!
//! 负责：
//! - 监听会话/项目/team 三类数据的文件变化
//! - 分类、过滤、映射为广播事件
//! - SSE 推送给所有在线 viewer

use std::sync::Arc;

use ai_cli_session_relay::relay::RelayServer;
use ai_cli_session_relay::RelayConfig;
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_cli_session_relay=debug".parse()?))
        .init();

    tracing::info!("🚀 vimo-relay v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = RelayConfig::from_env();
    tracing::info!("👁️ 数据目录: {:?}", config.data_dir);

    // 创建并运行 Relay
    let server = Arc::new(RelayServer::new(config)?);
    server.run().await?;

    tracing::info!("👋 vimo-relay exiting");
    Ok(())
}
