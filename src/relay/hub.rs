//! SSE 连接枢纽
//!
//! 维护在线连接集合，把广播事件扇出给每个连接。
//! 单连接的失败/堵塞不影响其他连接（fire-and-forget）。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{BroadcastEvent, ConnectionState, StreamMessage};

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<StreamMessage>;

/// 单个连接的服务端登记
struct Connection {
    sender: MessageSender,
    state: ConnectionState,
}

/// SSE 连接枢纽
pub struct StreamHub {
    /// 连接表：ConnId → 发送通道 + 存活状态
    connections: RwLock<HashMap<ConnId, Connection>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
}

impl StreamHub {
    /// 创建新的枢纽
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
        })
    }

    /// 注册新连接（初始为 Connecting），返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.connections.write().insert(
            conn_id,
            Connection {
                sender,
                state: ConnectionState::Connecting,
            },
        );

        tracing::debug!("📡 连接注册: conn_id={}", conn_id);
        conn_id
    }

    /// 传输握手完成，连接进入 Open，开始参与广播
    pub fn mark_open(&self, conn_id: ConnId) {
        if let Some(conn) = self.connections.write().get_mut(&conn_id) {
            conn.state = ConnectionState::Open;
            tracing::debug!("📡 连接就绪: conn_id={}", conn_id);
        }
    }

    /// 注销连接（断开 / 传输错误后由持有方调用）
    pub fn unregister(&self, conn_id: ConnId) {
        if self.connections.write().remove(&conn_id).is_some() {
            tracing::debug!("📡 连接注销: conn_id={}", conn_id);
        }
    }

    /// 广播事件给所有 Open 连接（非阻塞，fire-and-forget）
    ///
    /// payload 只序列化一次；发送失败的连接就地摘除。
    /// 不排队、不重试：断线窗口内的事件按约定丢失。
    pub fn broadcast(&self, event: &BroadcastEvent) {
        let message = event.to_message();

        let targets: Vec<(ConnId, MessageSender)> = {
            let conns = self.connections.read();
            conns
                .iter()
                .filter(|(_, c)| c.state == ConnectionState::Open)
                .map(|(id, c)| (*id, c.sender.clone()))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 无在线连接: event={}", message.event);
            return;
        }

        tracing::debug!(
            "📡 广播事件: event={}, connections={}",
            message.event,
            targets.len()
        );

        let mut dead: Vec<ConnId> = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // 慢连接：丢弃本条，不拖慢其他连接
                    tracing::warn!("📡 连接缓冲已满，丢弃消息: conn_id={}", conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(conn_id);
                }
            }
        }

        for conn_id in dead {
            self.unregister(conn_id);
        }
    }

    /// 发送事件到指定连接（connect 问候用；Connecting 状态也可达）
    pub fn send_to(&self, conn_id: ConnId, event: &BroadcastEvent) -> bool {
        let sender = {
            let conns = self.connections.read();
            conns.get(&conn_id).map(|c| c.sender.clone())
        };

        match sender {
            Some(sender) => sender.try_send(event.to_message()).is_ok(),
            None => false,
        }
    }

    /// 摘除接收端已消失的连接，保证扇出成本不随 churn 无界增长
    pub fn reap_closed(&self) {
        let dead: Vec<ConnId> = {
            let conns = self.connections.read();
            conns
                .iter()
                .filter(|(_, c)| c.sender.is_closed())
                .map(|(id, _)| *id)
                .collect()
        };

        if !dead.is_empty() {
            tracing::debug!("🧹 摘除失效连接: {:?}", dead);
            let mut conns = self.connections.write();
            for conn_id in dead {
                conns.remove(&conn_id);
            }
        }
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// 是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.connections.read().is_empty()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_changed() -> BroadcastEvent {
        BroadcastEvent::SessionChanged {
            project_id: "p1".to_string(),
            session_id: "s1".to_string(),
        }
    }

    #[test]
    fn test_broadcast_reaches_open_connections_only() {
        let hub = StreamHub::new();

        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);

        let conn1 = hub.register(tx1);
        let _conn2 = hub.register(tx2);

        // conn1 就绪，conn2 仍在握手
        hub.mark_open(conn1);

        hub.broadcast(&session_changed());

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_isolates_slow_connection() {
        let hub = StreamHub::new();

        // 容量 1 的慢连接：第二条消息被丢弃而不是阻塞
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(10);

        let slow = hub.register(slow_tx);
        let fast = hub.register(fast_tx);
        hub.mark_open(slow);
        hub.mark_open(fast);

        hub.broadcast(&session_changed());
        hub.broadcast(&session_changed());

        // 快连接两条都收到，慢连接只有第一条
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());

        // 慢连接没有被摘除（只是丢消息）
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn test_broadcast_reaps_closed_connection() {
        let hub = StreamHub::new();

        let (tx1, rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);

        let conn1 = hub.register(tx1);
        let conn2 = hub.register(tx2);
        hub.mark_open(conn1);
        hub.mark_open(conn2);

        // 客户端断开：接收端丢弃
        drop(rx1);

        hub.broadcast(&session_changed());

        assert_eq!(hub.connection_count(), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_reap_closed() {
        let hub = StreamHub::new();

        let (tx1, rx1) = mpsc::channel(10);
        let (tx2, _rx2) = mpsc::channel(10);

        let conn1 = hub.register(tx1);
        hub.register(tx2);
        hub.mark_open(conn1);
        assert_eq!(hub.connection_count(), 2);

        drop(rx1);
        hub.reap_closed();
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_send_to_connecting_connection() {
        let hub = StreamHub::new();
        let (tx, mut rx) = mpsc::channel(10);
        let conn_id = hub.register(tx);

        // 问候事件在 Open 之前就可以点对点发送
        assert!(hub.send_to(conn_id, &BroadcastEvent::Connect { timestamp: 1 }));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.event, "connect");

        assert!(!hub.send_to(9999, &BroadcastEvent::Connect { timestamp: 1 }));
    }

    #[test]
    fn test_unregister_idempotent() {
        let hub = StreamHub::new();
        let (tx, _rx) = mpsc::channel(10);
        let conn_id = hub.register(tx);

        hub.unregister(conn_id);
        hub.unregister(conn_id);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.has_connections());
    }
}
