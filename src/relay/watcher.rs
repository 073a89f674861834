//! 文件监听器
//!
//! 监听三个 watch root（history 单文件 / projects 树 / teams 树），
//! 把 OS 级通知翻译成带分类的 [`ChangeEvent`]。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode,
    Watcher,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::classifier::PathClassifier;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{ChangeEvent, ChangeKind, SourceCategory};

/// 事件通道容量
const EVENT_CHANNEL_SIZE: usize = 256;

/// 监听器对外事件
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// 通过过滤的文件变更
    Change(ChangeEvent),
    /// 运行期监听失败（权限回收、watch 描述符耗尽等），监听继续
    Error(String),
}

/// 文件监听器
///
/// `start()` 注册 OS watch 并执行一次全量扫描（合成 `Added` 事件），
/// 之后所有变更经过滤后推入返回的 channel。`stop()` 幂等。
pub struct ChangeWatcher {
    filter: Arc<WatchFilter>,
    history_path: PathBuf,
    projects_root: PathBuf,
    teams_root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ChangeWatcher {
    /// 创建监听器（校验排除规则，不访问文件系统）
    pub fn new(config: &RelayConfig, classifier: PathClassifier) -> Result<Arc<Self>> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::Config(format!("非法排除规则 {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| Error::Config(format!("排除规则编译失败: {e}")))?;

        let filter = Arc::new(WatchFilter {
            classifier,
            exclude,
            history_path: config.history_path(),
            projects_root: config.projects_root(),
            teams_root: config.teams_root(),
            max_depth: config.max_watch_depth,
            stopped: AtomicBool::new(false),
        });

        Ok(Arc::new(Self {
            history_path: config.history_path(),
            projects_root: config.projects_root(),
            teams_root: config.teams_root(),
            filter,
            watcher: Mutex::new(None),
        }))
    }

    /// 启动监听
    ///
    /// 任一 root 不可访问时返回 [`Error::WatchSetup`]；成功后先注册
    /// OS watch，再在 blocking 线程执行全量扫描，避免大目录树阻塞
    /// 事件循环。
    pub async fn start(&self) -> Result<mpsc::Receiver<WatcherEvent>> {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return Err(Error::Config("监听器已启动".to_string()));
        }
        self.filter.stopped.store(false, Ordering::SeqCst);

        // history 是单文件 root：监听其父目录（NonRecursive），
        // 文件被整体重写/替换时 watch 不会失效
        let history_parent = self
            .history_path
            .parent()
            .ok_or_else(|| Error::Config("history 路径没有父目录".to_string()))?
            .to_path_buf();

        for root in [&history_parent, &self.projects_root, &self.teams_root] {
            if !root.is_dir() {
                return Err(Error::WatchSetup {
                    path: root.clone(),
                    message: "目录缺失或不可访问".to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        // notify 回调线程 → tokio channel 的同步搬运
        let filter = self.filter.clone();
        let event_tx = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<NotifyEvent>| {
                if filter.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match res {
                    Ok(event) => {
                        for (path, kind) in translate(&event) {
                            if let Some(change) = filter.admit(&path, kind) {
                                if event_tx.blocking_send(WatcherEvent::Change(change)).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("👁️ 监听运行错误: {}", e);
                        let _ = event_tx.blocking_send(WatcherEvent::Error(e.to_string()));
                    }
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::WatchSetup {
            path: self.projects_root.clone(),
            message: format!("创建 watcher 失败: {e}"),
        })?;

        for (root, mode) in [
            (&history_parent, RecursiveMode::NonRecursive),
            (&self.projects_root, RecursiveMode::Recursive),
            (&self.teams_root, RecursiveMode::Recursive),
        ] {
            watcher
                .watch(root, mode)
                .map_err(|e| Error::WatchSetup {
                    path: root.clone(),
                    message: e.to_string(),
                })?;
            tracing::info!("👁️ Watching {:?} ({:?})", root, mode);
        }

        *guard = Some(watcher);
        drop(guard);

        // 启动全量扫描：已存在的状态以合成 Added 事件补发
        let filter = self.filter.clone();
        let scan_tx = tx;
        tokio::task::spawn_blocking(move || {
            let count = initial_scan(&filter, &scan_tx);
            tracing::info!("📊 启动扫描完成: {} 个已有条目", count);
        });

        Ok(rx)
    }

    /// 停止监听（幂等，未启动时调用安全）
    ///
    /// 返回后回调侧不再发送任何事件。
    pub fn stop(&self) {
        self.filter.stopped.store(true, Ordering::SeqCst);
        if self.watcher.lock().take().is_some() {
            tracing::info!("👁️ 文件监听已停止");
        }
    }
}

/// 过滤与分类上下文（notify 回调线程与扫描线程共享）
struct WatchFilter {
    classifier: PathClassifier,
    exclude: GlobSet,
    history_path: PathBuf,
    projects_root: PathBuf,
    teams_root: PathBuf,
    max_depth: usize,
    stopped: AtomicBool,
}

impl WatchFilter {
    /// 过滤一条候选变更；被过滤的路径不会进入 EventBus
    fn admit(&self, path: &Path, kind: ChangeKind) -> Option<ChangeEvent> {
        let category = self.classifier.classify(path);

        let root = match category {
            SourceCategory::Sessions => {
                // 精确匹配单文件，无需其余检查
                return Some(ChangeEvent {
                    path: path.to_path_buf(),
                    kind,
                    category,
                });
            }
            SourceCategory::Projects => &self.projects_root,
            SourceCategory::Teams => &self.teams_root,
            SourceCategory::Unknown => {
                tracing::debug!("忽略 watch root 之外的路径: {:?}", path);
                return None;
            }
        };

        let relative = path.strip_prefix(root).ok()?;

        // root 之下不接受 dotfile / 点目录
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return None;
        }

        // 深度上限：挡住对抗性深层目录
        if relative.components().count() > self.max_depth {
            return None;
        }

        if self.exclude.is_match(path) {
            return None;
        }

        match kind {
            // 新建目录只在 teams root 内有意义（新 team）；
            // projects 下的会话文件按 glob 单独观察，子目录本身不报
            ChangeKind::DirAdded => {
                if category != SourceCategory::Teams {
                    return None;
                }
            }
            _ => {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                let allowed = match category {
                    SourceCategory::Projects => ext == "jsonl",
                    SourceCategory::Teams => ext == "json",
                    _ => true,
                };
                if !allowed {
                    return None;
                }
            }
        }

        Some(ChangeEvent {
            path: path.to_path_buf(),
            kind,
            category,
        })
    }
}

/// notify 事件 → (路径, 变更类别) 列表
fn translate(event: &NotifyEvent) -> Vec<(PathBuf, ChangeKind)> {
    let kind = match event.kind {
        EventKind::Create(CreateKind::Folder) => ChangeKind::DirAdded,
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Added,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // 两个路径：旧名消失，新名出现
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), ChangeKind::Removed));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), ChangeKind::Added));
            }
            return out;
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // 平台未区分 rename 方向时按存在性判断
            return event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        ChangeKind::Added
                    } else {
                        ChangeKind::Removed
                    };
                    (p.clone(), kind)
                })
                .collect();
        }
        EventKind::Modify(_) => ChangeKind::Modified,
        // 目录删除不在事件模型内，只有新建目录有意义
        EventKind::Remove(RemoveKind::Folder) => return Vec::new(),
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return Vec::new(),
    };

    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

/// 单条补发的结果
enum ScanStep {
    Sent,
    Skipped,
    /// 已 stop 或消费端消失，整个扫描提前结束
    Abort,
}

fn scan_emit(
    filter: &WatchFilter,
    tx: &mpsc::Sender<WatcherEvent>,
    path: &Path,
    kind: ChangeKind,
) -> ScanStep {
    if filter.stopped.load(Ordering::SeqCst) {
        return ScanStep::Abort;
    }
    match filter.admit(path, kind) {
        Some(change) => {
            if tx.blocking_send(WatcherEvent::Change(change)).is_err() {
                ScanStep::Abort
            } else {
                ScanStep::Sent
            }
        }
        None => ScanStep::Skipped,
    }
}

/// 全量扫描三个 root，补发合成 Added 事件
///
/// 深度受 `max_depth` 约束；返回补发的事件数。
fn initial_scan(filter: &WatchFilter, tx: &mpsc::Sender<WatcherEvent>) -> usize {
    let mut count = 0usize;

    if filter.history_path.is_file() {
        match scan_emit(filter, tx, &filter.history_path, ChangeKind::Added) {
            ScanStep::Sent => count += 1,
            ScanStep::Skipped => {}
            ScanStep::Abort => return count,
        }
    }

    for root in [&filter.projects_root, &filter.teams_root] {
        let walk = WalkDir::new(root)
            .min_depth(1)
            .max_depth(filter.max_depth)
            .into_iter()
            .filter_map(|entry| entry.ok());

        for entry in walk {
            let kind = if entry.file_type().is_dir() {
                ChangeKind::DirAdded
            } else {
                ChangeKind::Added
            };
            match scan_emit(filter, tx, entry.path(), kind) {
                ScanStep::Sent => count += 1,
                ScanStep::Skipped => {}
                ScanStep::Abort => return count,
            }
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_filter(data_dir: &Path) -> WatchFilter {
        let config = RelayConfig {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        };
        WatchFilter {
            classifier: PathClassifier::new(&config),
            exclude: {
                let mut b = GlobSetBuilder::new();
                for p in &config.exclude {
                    b.add(Glob::new(p).unwrap());
                }
                b.build().unwrap()
            },
            history_path: config.history_path(),
            projects_root: config.projects_root(),
            teams_root: config.teams_root(),
            max_depth: config.max_watch_depth,
            stopped: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_admit_project_transcript() {
        let filter = test_filter(Path::new("/data/.claude"));
        let change = filter
            .admit(
                Path::new("/data/.claude/projects/p1/s1.jsonl"),
                ChangeKind::Modified,
            )
            .unwrap();
        assert_eq!(change.category, SourceCategory::Projects);
        assert_eq!(change.kind, ChangeKind::Modified);
    }

    #[test]
    fn test_admit_rejects_dotfiles_and_wrong_extension() {
        let filter = test_filter(Path::new("/data/.claude"));

        // root 之下的 dotfile 被过滤（root 自身的 .claude 不影响）
        assert!(filter
            .admit(
                Path::new("/data/.claude/projects/p1/.s1.jsonl.swp"),
                ChangeKind::Modified,
            )
            .is_none());

        // projects 下只接受 .jsonl
        assert!(filter
            .admit(
                Path::new("/data/.claude/projects/p1/notes.txt"),
                ChangeKind::Added,
            )
            .is_none());

        // teams 下只接受 .json
        assert!(filter
            .admit(
                Path::new("/data/.claude/teams/t1/log.jsonl"),
                ChangeKind::Added,
            )
            .is_none());
    }

    #[test]
    fn test_admit_dir_added_only_in_teams() {
        let filter = test_filter(Path::new("/data/.claude"));

        assert!(filter
            .admit(Path::new("/data/.claude/teams/t-new"), ChangeKind::DirAdded)
            .is_some());
        assert!(filter
            .admit(
                Path::new("/data/.claude/projects/p-new"),
                ChangeKind::DirAdded,
            )
            .is_none());
    }

    #[test]
    fn test_admit_exclusion_glob() {
        let filter = test_filter(Path::new("/data/.claude"));

        // 默认排除 inboxes 子树
        assert!(filter
            .admit(
                Path::new("/data/.claude/teams/t1/inboxes/member.json"),
                ChangeKind::Modified,
            )
            .is_none());
    }

    #[test]
    fn test_admit_depth_limit() {
        let filter = test_filter(Path::new("/data/.claude"));
        let deep = Path::new("/data/.claude/projects/a/b/c/d/e/f.jsonl");
        assert!(filter.admit(deep, ChangeKind::Added).is_none());
    }

    #[test]
    fn test_admit_history_file() {
        let filter = test_filter(Path::new("/data/.claude"));
        let change = filter
            .admit(Path::new("/data/.claude/history.jsonl"), ChangeKind::Modified)
            .unwrap();
        assert_eq!(change.category, SourceCategory::Sessions);
    }

    #[test]
    fn test_translate_create_and_remove() {
        let event = NotifyEvent {
            kind: EventKind::Create(CreateKind::File),
            paths: vec![PathBuf::from("/x/a.jsonl")],
            attrs: Default::default(),
        };
        assert_eq!(
            translate(&event),
            vec![(PathBuf::from("/x/a.jsonl"), ChangeKind::Added)]
        );

        let event = NotifyEvent {
            kind: EventKind::Remove(RemoveKind::File),
            paths: vec![PathBuf::from("/x/a.jsonl")],
            attrs: Default::default(),
        };
        assert_eq!(
            translate(&event),
            vec![(PathBuf::from("/x/a.jsonl"), ChangeKind::Removed)]
        );

        // 目录删除被忽略
        let event = NotifyEvent {
            kind: EventKind::Remove(RemoveKind::Folder),
            paths: vec![PathBuf::from("/x/dir")],
            attrs: Default::default(),
        };
        assert!(translate(&event).is_empty());
    }

    #[test]
    fn test_translate_rename_both() {
        let event = NotifyEvent {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/x/old.jsonl"), PathBuf::from("/x/new.jsonl")],
            attrs: Default::default(),
        };
        assert_eq!(
            translate(&event),
            vec![
                (PathBuf::from("/x/old.jsonl"), ChangeKind::Removed),
                (PathBuf::from("/x/new.jsonl"), ChangeKind::Added),
            ]
        );
    }
}
