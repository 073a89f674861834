//! Stream Client 连接逻辑
//!
//! 建立 SSE 长连接，按事件名分发给注册的回调；断线后按
//! 指数退避自动重连，连续失败达到上限后进入终态 Closed。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest_eventsource::{Event, EventSource};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::protocol::ConnectionState;

/// 事件回调
///
/// 回调身份由 `Arc` 指针决定：同一个 `Arc` 重复注册只生效一次，
/// `remove_event_listener` 也按指针匹配。
pub type EventCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// 终态断开回调（重连彻底失败时恰好触发一次）
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Client 配置
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// SSE 端点 URL
    pub url: String,
    /// 连续重连失败上限，超过后进入终态 Closed
    pub max_reconnect_attempts: u32,
    /// 重连基础延迟
    pub base_delay: Duration,
    /// 重连延迟上限
    pub max_delay: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: format!("http://{}/events", crate::config::DEFAULT_BIND_ADDR),
            max_reconnect_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(300_000),
        }
    }
}

impl StreamClientConfig {
    /// 创建指向给定端点的配置
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// 设置重连失败上限
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// 设置重连基础延迟
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }
}

/// 第 `attempt` 次重试前的等待时长：`min(base * 2^attempt, max)`
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    // 2^attempt 封顶防溢出；之后无论如何都会被 max 截住
    let factor = 1u64 << attempt.min(32);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// 监听注册表
#[derive(Default)]
struct Registry {
    /// 生效中的注册：事件名 → 回调列表
    live: HashMap<String, Vec<EventCallback>>,
    /// Open 之前的注册缓冲，在 Open 转换时一次性排空
    pending: Vec<(String, EventCallback)>,
}

impl Registry {
    fn contains(&self, name: &str, callback: &EventCallback) -> bool {
        let in_live = self
            .live
            .get(name)
            .map(|cbs| cbs.iter().any(|cb| Arc::ptr_eq(cb, callback)))
            .unwrap_or(false);
        let in_pending = self
            .pending
            .iter()
            .any(|(n, cb)| n == name && Arc::ptr_eq(cb, callback));
        in_live || in_pending
    }

    /// pending → live，每次 Open 转换恰好调用一次
    fn drain_pending(&mut self) {
        for (name, callback) in self.pending.drain(..) {
            self.live.entry(name).or_default().push(callback);
        }
    }

    fn clear(&mut self) {
        self.live.clear();
        self.pending.clear();
    }
}

struct ClientInner {
    config: StreamClientConfig,
    state: RwLock<ConnectionState>,
    registry: Mutex<Registry>,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl ClientInner {
    /// 分发一条入站消息
    ///
    /// payload 先按 JSON 解析；解析失败时原样以字符串送达（防御性
    /// 兜底，永不抛错、永不丢弃）。
    fn dispatch(&self, event: &str, data: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let payload = serde_json::from_str::<serde_json::Value>(data)
            .unwrap_or_else(|_| serde_json::Value::String(data.to_string()));

        // 回调可能反过来调 add/remove，先克隆再释放锁
        let callbacks: Vec<EventCallback> = {
            let registry = self.registry.lock();
            registry.live.get(event).cloned().unwrap_or_default()
        };

        for callback in callbacks {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            callback(payload.clone());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.write();
        // close() 之后 Closed 是终态，连接任务的残余状态翻转被忽略
        if self.closed.load(Ordering::SeqCst) && state != ConnectionState::Closed {
            return;
        }
        *guard = state;
    }

    /// 终态断开：on_close 恰好触发一次
    fn fire_on_close(&self) {
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Stream Client
///
/// `connect()` 后台维持连接；注册的监听跨重连存活。
pub struct StreamClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// 建立连接（立即返回，连接在后台任务中维持）
    pub fn connect(config: StreamClientConfig) -> Arc<Self> {
        let inner = Arc::new(ClientInner {
            config,
            state: RwLock::new(ConnectionState::Connecting),
            registry: Mutex::new(Registry::default()),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            run_connection(task_inner).await;
        });

        Arc::new(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// 注册事件监听
    ///
    /// 连接尚未 Open 时进入缓冲，Open 后统一生效，提前注册不会丢。
    /// 同一个回调（同一 `Arc`）重复注册是幂等的。
    pub fn add_event_listener(&self, name: &str, callback: EventCallback) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        // 先取注册表锁再读状态，与 Open 转换（同把锁内翻转状态）串行化
        let mut registry = self.inner.registry.lock();
        let open = *self.inner.state.read() == ConnectionState::Open;

        if registry.contains(name, &callback) {
            return;
        }

        if open {
            registry
                .live
                .entry(name.to_string())
                .or_default()
                .push(callback);
        } else {
            registry.pending.push((name.to_string(), callback));
        }
    }

    /// 移除事件监听（按回调指针身份；未注册时为 no-op）
    pub fn remove_event_listener(&self, name: &str, callback: &EventCallback) {
        let mut registry = self.inner.registry.lock();

        if let Some(callbacks) = registry.live.get_mut(name) {
            callbacks.retain(|cb| !Arc::ptr_eq(cb, callback));
            if callbacks.is_empty() {
                registry.live.remove(name);
            }
        }
        registry
            .pending
            .retain(|(n, cb)| !(n == name && Arc::ptr_eq(cb, callback)));
    }

    /// 注册终态断开回调
    pub fn on_close(&self, callback: CloseCallback) {
        *self.inner.on_close.lock() = Some(callback);
    }

    /// 当前连接状态
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// 主动关闭（幂等）
    ///
    /// 取消重连定时器、关闭传输、清空全部监听注册；
    /// 返回后不再有任何回调被触发。
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.set_state(ConnectionState::Closed);

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        self.inner.registry.lock().clear();
        tracing::debug!("🔌 StreamClient 已关闭");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// 连接维持循环：connecting → open → { 退避重连 | 终态 Closed }
async fn run_connection(inner: Arc<ClientInner>) {
    let mut failures: u32 = 0;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        inner.set_state(ConnectionState::Connecting);

        match stream_once(&inner, &mut failures).await {
            StreamEnd::ClientClosed => return,
            StreamEnd::TransportError(message) => {
                failures += 1;
                tracing::debug!(
                    "🔁 连接失败 (attempt={}): {}",
                    failures,
                    message
                );

                if failures >= inner.config.max_reconnect_attempts {
                    tracing::warn!(
                        "❌ 重连失败 {} 次，停止重试",
                        inner.config.max_reconnect_attempts
                    );
                    inner.set_state(ConnectionState::Closed);
                    inner.fire_on_close();
                    return;
                }

                let delay = backoff_delay(
                    inner.config.base_delay,
                    inner.config.max_delay,
                    failures - 1,
                );
                sleep(delay).await;
            }
        }
    }
}

enum StreamEnd {
    /// close() 被调用
    ClientClosed,
    /// 连接/流错误，交给外层退避
    TransportError(String),
}

/// 单次连接：打开 EventSource 并消费事件直到出错或关闭
async fn stream_once(inner: &Arc<ClientInner>, failures: &mut u32) -> StreamEnd {
    let mut es = EventSource::get(inner.config.url.as_str());

    while let Some(event) = es.next().await {
        if inner.closed.load(Ordering::SeqCst) {
            es.close();
            return StreamEnd::ClientClosed;
        }

        match event {
            Ok(Event::Open) => {
                tracing::debug!("🔗 连接就绪: {}", inner.config.url);
                // 成功打开即重置连续失败计数
                *failures = 0;
                // 排空缓冲与状态翻转在同一把锁内，
                // 并发的 add_event_listener 不会把注册漏在缓冲里
                {
                    let mut registry = inner.registry.lock();
                    registry.drain_pending();
                    inner.set_state(ConnectionState::Open);
                }
            }
            Ok(Event::Message(message)) => {
                inner.dispatch(&message.event, &message.data);
            }
            Err(e) => {
                es.close();
                return StreamEnd::TransportError(e.to_string());
            }
        }
    }

    // 流自然结束 = 服务端断开，同样走重连
    StreamEnd::TransportError("事件流已结束".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_doubles_until_cap() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(300_000);

        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(8000));

        // 大 attempt 被 max 截住（包括会溢出的取值）
        assert_eq!(backoff_delay(base, max, 20), max);
        assert_eq!(backoff_delay(base, max, 63), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_registry_set_semantics() {
        let mut registry = Registry::default();
        let callback: EventCallback = Arc::new(|_| {});

        registry.pending.push(("sessionChanged".to_string(), callback.clone()));
        assert!(registry.contains("sessionChanged", &callback));

        registry.drain_pending();
        assert!(registry.pending.is_empty());
        assert!(registry.contains("sessionChanged", &callback));
        assert_eq!(registry.live.get("sessionChanged").unwrap().len(), 1);

        // 不同 Arc（即使行为相同）是不同身份
        let other: EventCallback = Arc::new(|_| {});
        assert!(!registry.contains("sessionChanged", &other));
    }
}
