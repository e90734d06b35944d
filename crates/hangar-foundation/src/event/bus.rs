//! Event Bus - 도메인 이벤트 브로드캐스트
//!
//! 비동기 이벤트 발행/구독 시스템을 제공합니다. 발행자는 절대 블로킹되지
//! 않으며, 느린 구독자는 자기 큐에서만 뒤처집니다 (drop-oldest).

use super::types::{EventCategory, HangarEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

// ============================================================================
// EventListener Trait
// ============================================================================

/// 이벤트 리스너 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// 이벤트 리스너 trait
///
/// 이벤트를 수신하고 처리하는 컴포넌트(메트릭, 감사 로그)가 구현합니다.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 리스너 이름 (디버깅용)
    fn name(&self) -> &str;

    /// 관심 있는 이벤트 카테고리 (None이면 모든 이벤트)
    fn categories(&self) -> Option<Vec<EventCategory>> {
        None
    }

    /// 이벤트 처리
    async fn on_event(&self, event: &HangarEvent);
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 구독자별 큐 용량 (가득 차면 가장 오래된 이벤트부터 버림)
    pub channel_capacity: usize,

    /// 이벤트 히스토리 보관 개수
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 256,
        }
    }
}

/// 등록된 리스너의 배달 태스크 핸들
struct RegisteredListener {
    name: String,
    task: tokio::task::JoinHandle<()>,
}

/// 이벤트 버스
///
/// 각 리스너는 전용 broadcast 수신 큐를 가진 배달 태스크에서 실행됩니다.
/// `publish()`는 동기 호출이며 어떤 락도 await를 가로지르지 않습니다.
pub struct EventBus {
    config: EventBusConfig,

    /// 브로드캐스트 채널 송신자
    sender: broadcast::Sender<HangarEvent>,

    /// 등록된 리스너 태스크
    listeners: RwLock<HashMap<ListenerId, RegisteredListener>>,

    /// 리스너 ID 카운터
    listener_counter: AtomicU64,

    /// 이벤트 히스토리
    history: Mutex<VecDeque<HangarEvent>>,

    /// 발행된 이벤트 수
    event_count: AtomicU64,

    /// 구독자 큐에서 유실된 이벤트 수 (lag)
    dropped_count: AtomicU64,
}

impl EventBus {
    /// 기본 설정으로 이벤트 버스 생성
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 커스텀 설정으로 이벤트 버스 생성
    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            config,
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            event_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// 이벤트 발행
    ///
    /// 발행자는 블로킹되지 않습니다. 구독자가 없으면 이벤트는 히스토리에만
    /// 남습니다.
    pub fn publish(&self, event: HangarEvent) {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self.history.lock().expect("event history poisoned");
            history.push_back(event.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        // 수신자가 없으면 send는 Err를 반환하지만 정상 상황임
        let _ = self.sender.send(event);
    }

    /// 리스너 등록
    ///
    /// 리스너별 배달 태스크를 생성합니다. 큐가 넘치면 가장 오래된 이벤트가
    /// 유실되고 경고 로그를 남깁니다.
    pub fn subscribe(self: &Arc<Self>, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));
        let name = listener.name().to_string();

        debug!(listener_name = %name, listener_id = %id, "Registering event listener");

        let mut rx = self.sender.subscribe();
        // 태스크는 Weak만 들고 있어야 버스가 drop될 수 있음
        let bus = Arc::downgrade(self);
        let categories = listener.categories();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let interested = match &categories {
                            Some(cats) => cats.contains(&event.category),
                            None => true,
                        };
                        if interested {
                            listener.on_event(&event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if let Some(bus) = bus.upgrade() {
                            bus.dropped_count.fetch_add(n, Ordering::Relaxed);
                        }
                        warn!(
                            listener_name = listener.name(),
                            dropped = n,
                            "Slow event listener dropped oldest events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.listeners
            .write()
            .expect("listener map poisoned")
            .insert(id, RegisteredListener { name, task });

        id
    }

    /// 리스너 해제
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self
            .listeners
            .write()
            .expect("listener map poisoned")
            .remove(&id);

        if let Some(registered) = removed {
            registered.task.abort();
            debug!(listener_id = %id, listener_name = %registered.name, "Unregistered event listener");
            true
        } else {
            false
        }
    }

    /// 브로드캐스트 수신자 생성 (스트림 방식 구독)
    pub fn receiver(&self) -> broadcast::Receiver<HangarEvent> {
        self.sender.subscribe()
    }

    /// 최근 이벤트 히스토리 조회 (최신순)
    pub fn history(&self, limit: Option<usize>) -> Vec<HangarEvent> {
        let history = self.history.lock().expect("event history poisoned");
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// 등록된 리스너 수
    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("listener map poisoned").len()
    }

    /// 총 발행된 이벤트 수
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// 구독자 큐에서 유실된 이벤트 수
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(listeners) = self.listeners.read() {
            for registered in listeners.values() {
                registered.task.abort();
            }
        }
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct TestListener {
        name: String,
        count: AtomicUsize,
    }

    impl TestListener {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                count: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventListener for TestListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_event(&self, _event: &HangarEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_event_bus_basic() {
        let bus = Arc::new(EventBus::new());

        let listener = Arc::new(TestListener::new("test"));
        let id = bus.subscribe(listener.clone());
        assert_eq!(bus.listener_count(), 1);

        bus.publish(HangarEvent::new("test.event", EventCategory::System));
        wait_for(|| listener.call_count() == 1).await;

        assert!(bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_category_filter() {
        struct ToolOnly(TestListener);

        #[async_trait]
        impl EventListener for ToolOnly {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn categories(&self) -> Option<Vec<EventCategory>> {
                Some(vec![EventCategory::Tool])
            }
            async fn on_event(&self, event: &HangarEvent) {
                self.0.on_event(event).await;
            }
        }

        let bus = Arc::new(EventBus::new());
        let listener = Arc::new(ToolOnly(TestListener::new("tool-only")));
        bus.subscribe(listener.clone());

        bus.publish(HangarEvent::new("system.started", EventCategory::System));
        bus.publish(HangarEvent::new("tool.invoked", EventCategory::Tool));

        wait_for(|| listener.0.call_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.0.call_count(), 1);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let bus = Arc::new(EventBus::with_config(EventBusConfig {
            history_size: 5,
            ..Default::default()
        }));

        for i in 0..10 {
            bus.publish(HangarEvent::new(
                format!("test.event.{}", i),
                EventCategory::System,
            ));
        }

        let history = bus.history(None);
        assert_eq!(history.len(), 5);
        // 최신순
        assert_eq!(history[0].event_type, "test.event.9");
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_slow_listener() {
        let bus = Arc::new(EventBus::with_config(EventBusConfig {
            channel_capacity: 4,
            ..Default::default()
        }));

        struct SlowListener;

        #[async_trait]
        impl EventListener for SlowListener {
            fn name(&self) -> &str {
                "slow"
            }
            async fn on_event(&self, _event: &HangarEvent) {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }

        bus.subscribe(Arc::new(SlowListener));

        // 느린 구독자가 있어도 발행은 즉시 끝나야 함
        let start = std::time::Instant::now();
        for _ in 0..100 {
            bus.publish(HangarEvent::new("test.flood", EventCategory::System));
        }
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(bus.event_count(), 100);
    }
}
