//! 变更事件与推送协议定义
//!
//! 通信方式：SSE（长连接 HTTP，单向 Server → Viewer）。
//! 每条消息 = 事件名 + 一行 JSON payload；不带事件 ID，不支持断线回放。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 逻辑数据源分类
///
/// 每个变更路径恰好归属一个分类，由 [`crate::classifier::PathClassifier`]
/// 确定性计算得出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    /// 会话历史（单个 history.jsonl 文件）
    Sessions,
    /// 项目会话转录（projects/<project>/<session>.jsonl）
    Projects,
    /// Team 状态（teams/<team>/*.json）
    Teams,
    /// 未匹配任何 root（记录告警，不产生广播）
    Unknown,
}

/// 文件系统变更类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// 新增文件（含启动全量扫描合成的事件）
    Added,
    /// 文件内容修改
    Modified,
    /// 文件删除
    Removed,
    /// 新增目录（仅 teams root 内有意义）
    DirAdded,
}

/// 文件系统变更事件
///
/// 由 ChangeWatcher 产生，EventBus 消费一次后丢弃，不持久化。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// 绝对路径
    pub path: PathBuf,
    /// 变更类别
    pub kind: ChangeKind,
    /// 逻辑数据源
    pub category: SourceCategory,
}

/// 已知的广播事件名常量（wire 契约）
pub mod event_name {
    pub const CONNECT: &str = "connect";
    pub const SESSION_CHANGED: &str = "sessionChanged";
    pub const SESSION_LIST_CHANGED: &str = "sessionListChanged";
    pub const AGENT_SESSION_CHANGED: &str = "agentSessionChanged";
    pub const TEAM_CHANGED: &str = "teamChanged";
}

/// 广播事件（EventBus → StreamHub 边界上的封闭类型）
///
/// 外层传输仍是字符串事件名 + JSON payload（见 [`StreamMessage`]），
/// 开放扩展点只保留在那一层。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    /// 连接建立问候（仅发给新连接本身）
    Connect {
        /// epoch 毫秒
        timestamp: i64,
    },

    /// 某个会话转录有新内容
    SessionChanged {
        project_id: String,
        session_id: String,
    },

    /// 某项目（或全局历史）的会话列表发生变化
    SessionListChanged {
        /// None 表示来自全局 history 文件的变化
        project_id: Option<String>,
    },

    /// 某个 agent 子会话转录有新内容
    AgentSessionChanged {
        project_id: String,
        agent_session_id: String,
    },

    /// 某个 team 的状态发生变化（含新建 team 目录）
    TeamChanged { team_id: String },
}

impl BroadcastEvent {
    /// wire 事件名
    pub fn name(&self) -> &'static str {
        match self {
            BroadcastEvent::Connect { .. } => event_name::CONNECT,
            BroadcastEvent::SessionChanged { .. } => event_name::SESSION_CHANGED,
            BroadcastEvent::SessionListChanged { .. } => event_name::SESSION_LIST_CHANGED,
            BroadcastEvent::AgentSessionChanged { .. } => event_name::AGENT_SESSION_CHANGED,
            BroadcastEvent::TeamChanged { .. } => event_name::TEAM_CHANGED,
        }
    }

    /// wire payload（camelCase 键）
    pub fn payload(&self) -> serde_json::Value {
        match self {
            BroadcastEvent::Connect { timestamp } => {
                serde_json::json!({ "timestamp": timestamp })
            }
            BroadcastEvent::SessionChanged {
                project_id,
                session_id,
            } => serde_json::json!({
                "projectId": project_id,
                "sessionId": session_id,
            }),
            BroadcastEvent::SessionListChanged { project_id } => {
                serde_json::json!({ "projectId": project_id })
            }
            BroadcastEvent::AgentSessionChanged {
                project_id,
                agent_session_id,
            } => serde_json::json!({
                "projectId": project_id,
                "agentSessionId": agent_session_id,
            }),
            BroadcastEvent::TeamChanged { team_id } => {
                serde_json::json!({ "teamId": team_id })
            }
        }
    }

    /// 转换为传输层消息（payload 序列化恰好一次）
    pub fn to_message(&self) -> StreamMessage {
        StreamMessage {
            event: self.name().to_string(),
            data: self.payload().to_string(),
        }
    }
}

/// 传输层消息：事件名 + 已序列化的 JSON payload
///
/// Hub 广播前序列化一次，随后对所有连接复用同一份字符串。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// 事件名
    pub event: String,
    /// JSON payload（一行）
    pub data: String,
}

/// 连接存活状态（Server 端 Connection 与 Client 端共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 已注册，传输握手未完成
    Connecting,
    /// 可收发
    Open,
    /// 终态，不再恢复
    Closed,
}
