//! 테스트 지원 - 인프로세스 mock 전송
//!
//! 실제 자식 프로세스 없이 provider 런타임을 구동하기 위한 mock입니다.
//! 통합 테스트와 하위 crate의 테스트에서 사용합니다.

use crate::config::{Mode, ProviderEntry, ProviderSpec};
use crate::transport::{JsonRpcNotification, Transport, TransportFactory, TransportHandle};
use async_trait::async_trait;
use hangar_foundation::{Error, ProviderId, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// mock 백엔드의 동작 설정 + 관측값
#[derive(Debug)]
pub struct MockBehavior {
    /// 전송 시작(launch) 횟수
    pub launch_count: AtomicUsize,

    /// 시작 전 지연 (cold start 시뮬레이션)
    pub start_delay: Mutex<Duration>,

    /// 남은 연결 실패 횟수 (양수면 connect가 transport 에러로 실패)
    pub fail_connects: AtomicI64,

    /// 남은 호출 실패 횟수 (양수면 tools/call이 transport 에러로 실패)
    pub fail_calls: AtomicI64,

    /// tools/call 지연
    pub call_delay: Mutex<Duration>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            launch_count: AtomicUsize::new(0),
            start_delay: Mutex::new(Duration::ZERO),
            fail_connects: AtomicI64::new(0),
            fail_calls: AtomicI64::new(0),
            call_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MockBehavior {
    pub fn launches(&self) -> usize {
        self.launch_count.load(Ordering::SeqCst)
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    /// 다음 n번의 연결을 실패시킴
    pub fn fail_next_connects(&self, n: i64) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// 다음 n번의 tools/call을 실패시킴
    pub fn fail_next_calls(&self, n: i64) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }
}

/// 인프로세스 mock 전송
///
/// `add(a, b)` 도구 하나를 노출합니다.
pub struct MockTransport {
    behavior: Arc<MockBehavior>,
    alive: AtomicBool,
    notifications: mpsc::Sender<JsonRpcNotification>,
}

impl MockTransport {
    /// 전송을 강제로 죽임 (프로세스 crash 시뮬레이션)
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// 서버 발신 알림 주입
    pub async fn push_notification(&self, method: &str) {
        let _ = self
            .notifications
            .send(JsonRpcNotification::new(method, None))
            .await;
    }

    fn tools_payload() -> Value {
        serde_json::json!({
            "tools": [{
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": {"type": "number"},
                        "b": {"type": "number"}
                    },
                    "required": ["a", "b"]
                }
            }]
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::Transport("mock transport killed".to_string()));
        }

        match method {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": crate::session::MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-server", "version": "0.0.1"}
            })),
            "tools/list" => Ok(Self::tools_payload()),
            "tools/call" => {
                if self.behavior.fail_calls.fetch_sub(1, Ordering::SeqCst) > 0 {
                    return Err(Error::Transport("mock call failure".to_string()));
                }

                let delay = *self.behavior.call_delay.lock().unwrap();
                if !delay.is_zero() {
                    if delay >= deadline {
                        tokio::time::sleep(deadline).await;
                        return Err(Error::Timeout("mock call deadline".to_string()));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }

                let params = params.unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or_default();
                let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                let sum = a + b;

                Ok(serde_json::json!({
                    "content": [{"type": "text", "text": sum.to_string()}],
                    "structuredContent": {"result": sum},
                    "isError": false
                }))
            }
            other => Err(Error::Rpc {
                code: -32601,
                message: format!("method not found: {}", other),
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::Transport("mock transport killed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// mock 전송 팩토리
///
/// 생성된 전송들을 보관해서 테스트가 임의로 죽일 수 있게 합니다.
pub struct MockTransportFactory {
    pub behavior: Arc<MockBehavior>,
    spawned: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            behavior: Arc::new(MockBehavior::default()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(behavior: Arc<MockBehavior>) -> Self {
        Self {
            behavior,
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// 지금까지 만들어진 전송들
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.spawned.lock().unwrap().clone()
    }

    /// 마지막으로 만들어진 전송을 죽임
    pub fn kill_latest(&self) {
        if let Some(transport) = self.spawned.lock().unwrap().last() {
            transport.kill();
        }
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(&self, _spec: &ProviderSpec) -> Result<TransportHandle> {
        let delay = *self.behavior.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.behavior.fail_connects.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(Error::Transport("mock connection refused".to_string()));
        }

        self.behavior.launch_count.fetch_add(1, Ordering::SeqCst);

        let (notif_tx, notif_rx) = mpsc::channel(8);
        let transport = Arc::new(MockTransport {
            behavior: Arc::clone(&self.behavior),
            alive: AtomicBool::new(true),
            notifications: notif_tx,
        });
        self.spawned.lock().unwrap().push(Arc::clone(&transport));

        Ok(TransportHandle {
            transport,
            notifications: notif_rx,
        })
    }
}

/// 테스트용 subprocess provider 스펙
pub fn mock_provider_spec(id: &str) -> ProviderSpec {
    let entry = ProviderEntry {
        mode: Mode::Subprocess,
        command: Some(vec!["mock-server".to_string()]),
        ..Default::default()
    };
    entry
        .to_provider_spec(ProviderId::new(id).expect("valid test id"))
        .expect("valid test spec")
}
