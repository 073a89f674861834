//! 路径分类器
//!
//! 把绝对路径映射到逻辑数据源分类。纯函数，无副作用，
//! 同一路径（即使分隔符写法不同）永远得到同一分类。

use std::path::Path;

use crate::config::RelayConfig;
use crate::protocol::SourceCategory;

/// 词法归一化路径：统一分隔符为 `/`，消去 `.` 与 `..`
///
/// 只做词法处理，不访问文件系统（symlink 不解析）。
pub fn normalize_path(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let absolute = raw.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// 路径分类器
///
/// 三个 root 在启动时归一化一次，之后 `classify` 只做字符串比较。
#[derive(Debug, Clone)]
pub struct PathClassifier {
    /// 会话历史文件（精确匹配）
    history_path: String,
    /// 项目会话目录（前缀匹配）
    projects_root: String,
    /// Team 状态目录（前缀匹配）
    teams_root: String,
}

impl PathClassifier {
    /// 从配置创建分类器
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            history_path: normalize_path(&config.history_path()),
            projects_root: normalize_path(&config.projects_root()),
            teams_root: normalize_path(&config.teams_root()),
        }
    }

    /// 路径 → 逻辑数据源
    ///
    /// 优先级：history 精确匹配 → teams 前缀 → projects 前缀 → Unknown。
    /// teams 在 projects 之前判断，保证嵌套布局下 teams 树不会被
    /// 前缀更短的 projects root 抢先命中。
    pub fn classify(&self, path: &Path) -> SourceCategory {
        let normalized = normalize_path(path);

        if normalized == self.history_path {
            SourceCategory::Sessions
        } else if is_within(&normalized, &self.teams_root) {
            SourceCategory::Teams
        } else if is_within(&normalized, &self.projects_root) {
            SourceCategory::Projects
        } else {
            SourceCategory::Unknown
        }
    }

    /// projects root 下的第一层目录名 = project id
    pub fn project_id_for(&self, path: &Path) -> Option<String> {
        first_component_under(&normalize_path(path), &self.projects_root)
    }

    /// teams root 下的第一层目录名 = team id
    ///
    /// 直接位于 teams root 下的目录本身也算（新建 team 的场景）。
    pub fn team_id_for(&self, path: &Path) -> Option<String> {
        first_component_under(&normalize_path(path), &self.teams_root)
    }

    /// 转录文件名（不含扩展名）= session id
    pub fn session_id_for(&self, path: &Path) -> Option<String> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
    }
}

/// `path` 是否位于 `root` 之内（不含 root 自身）
fn is_within(path: &str, root: &str) -> bool {
    path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/'
}

/// `path` 相对 `root` 的第一段
fn first_component_under(path: &str, root: &str) -> Option<String> {
    if !is_within(path, root) {
        return None;
    }
    let rest = &path[root.len() + 1..];
    let first = rest.split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classifier() -> PathClassifier {
        let config = RelayConfig {
            data_dir: PathBuf::from("/home/u/.claude"),
            ..Default::default()
        };
        PathClassifier::new(&config)
    }

    #[test]
    fn test_classify_history_file() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/home/u/.claude/history.jsonl")),
            SourceCategory::Sessions
        );
    }

    #[test]
    fn test_classify_projects_and_teams() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/home/u/.claude/projects/p1/s1.jsonl")),
            SourceCategory::Projects
        );
        assert_eq!(
            c.classify(Path::new("/home/u/.claude/teams/t1/config.json")),
            SourceCategory::Teams
        );
        // root 目录本身不属于任何分类
        assert_eq!(
            c.classify(Path::new("/home/u/.claude/projects")),
            SourceCategory::Unknown
        );
    }

    #[test]
    fn test_classify_unknown() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/home/u/.claude/statsig/cache.json")),
            SourceCategory::Unknown
        );
        assert_eq!(
            c.classify(Path::new("/etc/passwd")),
            SourceCategory::Unknown
        );
    }

    #[test]
    fn test_classify_idempotent_across_separators() {
        let c = classifier();
        let unix = Path::new("/home/u/.claude/teams/t1/config.json");
        let windows = Path::new("/home/u\\.claude\\teams\\t1\\config.json");
        let dotted = Path::new("/home/u/.claude/teams/./t1/../t1/config.json");

        assert_eq!(c.classify(unix), SourceCategory::Teams);
        assert_eq!(c.classify(windows), SourceCategory::Teams);
        assert_eq!(c.classify(dotted), SourceCategory::Teams);
        // 重复调用结果稳定
        assert_eq!(c.classify(unix), c.classify(unix));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.jsonl")),
            "/a/c/d.jsonl"
        );
        assert_eq!(normalize_path(Path::new("a\\b\\c")), "a/b/c");
        assert_eq!(normalize_path(Path::new("/a//b/")), "/a/b");
    }

    #[test]
    fn test_id_derivation() {
        let c = classifier();

        assert_eq!(
            c.project_id_for(Path::new("/home/u/.claude/projects/p1/s1.jsonl")),
            Some("p1".to_string())
        );
        assert_eq!(
            c.team_id_for(Path::new("/home/u/.claude/teams/t9")),
            Some("t9".to_string())
        );
        assert_eq!(
            c.session_id_for(Path::new("/home/u/.claude/projects/p1/s1.jsonl")),
            Some("s1".to_string())
        );
        // projects root 之外没有 project id
        assert_eq!(c.project_id_for(Path::new("/home/u/.claude/history.jsonl")), None);
    }
}
