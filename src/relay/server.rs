//! Relay 服务器
//!
//! HTTP/SSE 服务：`GET /events` 建立长连接推送，`GET /health` 返回
//! 版本与连接数。监听、总线、枢纽在 `start()` 中装配。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::classifier::PathClassifier;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::BroadcastEvent;

use super::bus::EventBus;
use super::hub::{ConnId, StreamHub};
use super::watcher::ChangeWatcher;

/// Relay 版本号（跟随 crate 版本）
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 单连接发送缓冲大小
const CONNECTION_BUFFER_SIZE: usize = 64;

/// SSE keepalive 间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// 失效连接摘除间隔
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Relay 服务
pub struct RelayServer {
    config: RelayConfig,
    classifier: PathClassifier,
    watcher: Arc<ChangeWatcher>,
    hub: Arc<StreamHub>,
}

/// 路由共享状态
#[derive(Clone)]
struct AppState {
    hub: Arc<StreamHub>,
}

impl RelayServer {
    /// 创建 Relay（校验配置，不访问文件系统）
    pub fn new(config: RelayConfig) -> Result<Self> {
        let classifier = PathClassifier::new(&config);
        let watcher = ChangeWatcher::new(&config, classifier.clone())?;
        let hub = StreamHub::new();

        Ok(Self {
            config,
            classifier,
            watcher,
            hub,
        })
    }

    /// 连接枢纽句柄（嵌入方 / 测试用）
    pub fn hub(&self) -> Arc<StreamHub> {
        self.hub.clone()
    }

    /// 装配监听管线：watcher → bus → hub
    ///
    /// watch root 不可用时在此失败（[`Error::WatchSetup`]），
    /// 成功后监听事件开始流动。
    pub async fn start(&self) -> Result<()> {
        let rx = self.watcher.start().await?;

        let bus = EventBus::new(self.classifier.clone());
        let hub = self.hub.clone();
        tokio::spawn(async move {
            bus.pump(rx, hub).await;
        });

        let hub = self.hub.clone();
        tokio::spawn(async move {
            let mut tick = interval(REAP_INTERVAL);
            loop {
                tick.tick().await;
                hub.reap_closed();
            }
        });

        Ok(())
    }

    /// 构建 HTTP 路由（独立运行或挂载到上层应用皆可）
    pub fn router(&self) -> Router {
        Router::new()
            .route("/events", get(events_handler))
            .route("/health", get(health_handler))
            .with_state(AppState {
                hub: self.hub.clone(),
            })
    }

    /// 运行 Relay：装配管线并服务 HTTP，直到收到中断信号
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.start().await?;

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Connection(format!("绑定 {} 失败: {e}", self.config.bind_addr)))?;

        tracing::info!("🚀 Relay 启动: http://{}", self.config.bind_addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.stop();
        Ok(())
    }

    /// 停止监听（幂等）
    pub fn stop(&self) {
        self.watcher.stop();
        tracing::info!("🧹 Relay 清理完成");
    }
}

/// 连接守卫：SSE 流被 drop（客户端断开 / 传输错误）时注销连接
struct ConnectionGuard {
    hub: Arc<StreamHub>,
    conn_id: ConnId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.conn_id);
    }
}

/// SSE 长连接入口
///
/// 注册 → 发送 `connect` 问候（仅本连接）→ 标记 Open → 返回事件流。
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
    let conn_id = state.hub.register(tx);

    state.hub.send_to(
        conn_id,
        &BroadcastEvent::Connect {
            timestamp: Utc::now().timestamp_millis(),
        },
    );
    state.hub.mark_open(conn_id);

    let guard = ConnectionGuard {
        hub: state.hub.clone(),
        conn_id,
    };

    let stream = ReceiverStream::new(rx).map(move |msg| {
        let _keep = &guard;
        Ok(SseEvent::default().event(msg.event).data(msg.data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// 健康检查：版本 + 当前连接数
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": RELAY_VERSION,
        "connections": state.hub.connection_count(),
    }))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("收到中断信号，准备退出...");
    }
}
