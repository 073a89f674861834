//! Relay 配置

use std::net::SocketAddr;
use std::path::PathBuf;

/// 默认监听地址（仅本机回环）
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4876";

/// 默认递归监听深度上限
///
/// projects/teams 两棵树都只有一层嵌套（`projects/<project>/<session>.jsonl`）。
/// 上限略放宽以容忍 team 子目录（如 inboxes/），同时挡住对抗性深层目录。
pub const DEFAULT_MAX_WATCH_DEPTH: usize = 4;

/// Relay 配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// AI CLI 数据目录（默认 ~/.claude）
    pub data_dir: PathBuf,

    /// SSE 服务监听地址
    pub bind_addr: SocketAddr,

    /// 递归监听深度上限（相对各 watch root）
    pub max_watch_depth: usize,

    /// 排除规则（glob，命中的路径不会产生任何事件）
    pub exclude: Vec<String>,
}

impl RelayConfig {
    /// 从环境变量或默认路径创建配置
    ///
    /// - `AI_CLI_SESSION_DIR` 覆盖数据目录
    /// - `VIMO_RELAY_BIND` 覆盖监听地址
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("AI_CLI_SESSION_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(addr) = std::env::var("VIMO_RELAY_BIND") {
            if let Ok(addr) = addr.parse() {
                config.bind_addr = addr;
            }
        }

        config
    }

    /// 会话历史文件路径（单文件 root）
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.jsonl")
    }

    /// 项目会话目录（每项目一个子目录，内含 *.jsonl 转录）
    pub fn projects_root(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    /// Team 状态目录（每 team 一个子目录，内含 *.json 状态文件）
    pub fn teams_root(&self) -> PathBuf {
        self.data_dir.join("teams")
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude");

        Self {
            data_dir,
            bind_addr: DEFAULT_BIND_ADDR.parse().expect("默认监听地址合法"),
            max_watch_depth: DEFAULT_MAX_WATCH_DEPTH,
            // inboxes 子树由 team 成员高频互写，单独的状态事件没有意义
            exclude: vec!["**/inboxes/**".to_string(), "**/*.tmp".to_string()],
        }
    }
}
