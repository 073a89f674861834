//! 事件总线
//!
//! 把带分类的文件变更映射为广播事件：每条 [`ChangeEvent`] 确定性地
//! 产生零或一条 [`BroadcastEvent`]，随后交给 StreamHub 扇出。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::classifier::PathClassifier;
use crate::protocol::{BroadcastEvent, ChangeEvent, ChangeKind, SourceCategory};

use super::hub::StreamHub;
use super::watcher::WatcherEvent;

/// agent 子会话转录的文件名前缀
pub const AGENT_TRANSCRIPT_PREFIX: &str = "agent-";

/// 事件总线
pub struct EventBus {
    classifier: PathClassifier,
}

impl EventBus {
    /// 创建事件总线
    pub fn new(classifier: PathClassifier) -> Self {
        Self { classifier }
    }

    /// 变更 → 广播的确定性映射
    ///
    /// - projects 转录修改 → `sessionChanged` / `agentSessionChanged`
    /// - projects 转录增删 → `sessionListChanged`（该项目的列表变了）
    /// - history 文件任何变化 → `sessionListChanged`（无项目维度）
    /// - teams 内任何变化（含新 team 目录）→ `teamChanged`
    pub fn map(&self, change: &ChangeEvent) -> Option<BroadcastEvent> {
        match change.category {
            SourceCategory::Sessions => {
                Some(BroadcastEvent::SessionListChanged { project_id: None })
            }

            SourceCategory::Projects => {
                let project_id = self.classifier.project_id_for(&change.path)?;
                match change.kind {
                    ChangeKind::Modified => {
                        let session_id = self.classifier.session_id_for(&change.path)?;
                        if session_id.starts_with(AGENT_TRANSCRIPT_PREFIX) {
                            Some(BroadcastEvent::AgentSessionChanged {
                                project_id,
                                agent_session_id: session_id,
                            })
                        } else {
                            Some(BroadcastEvent::SessionChanged {
                                project_id,
                                session_id,
                            })
                        }
                    }
                    ChangeKind::Added | ChangeKind::Removed => {
                        Some(BroadcastEvent::SessionListChanged {
                            project_id: Some(project_id),
                        })
                    }
                    // watcher 已挡掉 projects 下的目录事件
                    ChangeKind::DirAdded => None,
                }
            }

            SourceCategory::Teams => {
                let team_id = self.classifier.team_id_for(&change.path)?;
                Some(BroadcastEvent::TeamChanged { team_id })
            }

            SourceCategory::Unknown => {
                tracing::warn!("⚠️ 未匹配任何 watch root 的变更: {:?}", change.path);
                None
            }
        }
    }

    /// 泵任务：消费 watcher 通道直到其关闭
    ///
    /// 运行期监听错误在此记录并继续；映射结果逐条交给 hub。
    pub async fn pump(self, mut rx: mpsc::Receiver<WatcherEvent>, hub: Arc<StreamHub>) {
        while let Some(event) = rx.recv().await {
            match event {
                WatcherEvent::Change(change) => {
                    if let Some(broadcast) = self.map(&change) {
                        hub.broadcast(&broadcast);
                    }
                }
                WatcherEvent::Error(message) => {
                    tracing::error!("👁️ 监听运行错误: {}", message);
                }
            }
        }
        tracing::debug!("事件总线退出（watcher 通道关闭）");
    }
}
