//! HTTP Transport - Streamable-HTTP/SSE 원격 통신
//!
//! 설정된 엔드포인트로 JSON-RPC를 POST하고, 응답은 JSON 본문 또는 SSE
//! 스트림으로 수신합니다. 서버가 GET SSE 스트림을 제공하면 서버 발신
//! 알림도 같은 채널로 수신합니다.

use super::{unwrap_response, JsonRpcIncoming, JsonRpcNotification, JsonRpcRequest, Transport};
use crate::config::HttpTimeouts;
use async_trait::async_trait;
use futures::StreamExt;
use hangar_foundation::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// HTTP Transport
pub struct HttpTransport {
    /// 엔드포인트 URL
    endpoint: String,

    /// 요청 ID 카운터
    request_id: AtomicU64,

    /// HTTP 클라이언트
    client: reqwest::Client,

    /// 대기 중인 요청들
    pending: PendingMap,

    /// 연결 상태
    connected: Arc<AtomicBool>,

    /// 서버 발신 알림 채널
    notifications: mpsc::Sender<JsonRpcNotification>,
}

impl HttpTransport {
    /// 원격 엔드포인트 연결 생성
    pub async fn connect(
        endpoint: &str,
        timeouts: &HttpTimeouts,
        notifications: mpsc::Sender<JsonRpcNotification>,
    ) -> Result<Self> {
        info!("Connecting to remote MCP endpoint: {}", endpoint);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(timeouts.connect_timeout))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // 서버가 GET SSE 스트림을 제공하면 알림/응답 수신 경로로 사용
        let listener_pending = Arc::clone(&pending);
        let listener_notifications = notifications.clone();
        let listener_client = client.clone();
        let listener_url = endpoint.to_string();
        tokio::spawn(async move {
            Self::sse_listener(
                listener_url,
                listener_client,
                listener_pending,
                listener_notifications,
            )
            .await;
        });

        Ok(Self {
            endpoint: endpoint.to_string(),
            request_id: AtomicU64::new(1),
            client,
            pending,
            connected,
            notifications,
        })
    }

    /// GET SSE 수신 루프
    ///
    /// 엔드포인트가 GET을 지원하지 않는 경우(순수 Streamable HTTP)에는
    /// 조용히 종료합니다. POST 응답 경로가 계속 동작하므로 전송은 죽지
    /// 않습니다.
    async fn sse_listener(
        url: String,
        client: reqwest::Client,
        pending: PendingMap,
        notifications: mpsc::Sender<JsonRpcNotification>,
    ) {
        use reqwest_eventsource::{Event, EventSource};

        let mut es = match EventSource::new(client.get(&url)) {
            Ok(es) => es,
            Err(e) => {
                debug!("SSE listener unavailable: {}", e);
                return;
            }
        };

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {
                    debug!("SSE stream opened: {}", url);
                }
                Ok(Event::Message(message)) => {
                    Self::route_incoming(&message.data, &pending, &notifications);
                }
                Err(e) => {
                    debug!("SSE stream ended: {}", e);
                    break;
                }
            }
        }
    }

    /// 수신 메시지를 응답/알림으로 분류
    fn route_incoming(
        data: &str,
        pending: &PendingMap,
        notifications: &mpsc::Sender<JsonRpcNotification>,
    ) {
        let incoming: JsonRpcIncoming = match serde_json::from_str(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Unparseable SSE payload: {}", e);
                return;
            }
        };

        match (incoming.id, incoming.method) {
            (Some(id), None) => {
                let sender = pending.lock().expect("pending map poisoned").remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(unwrap_response(incoming.result, incoming.error));
                    }
                    None => debug!("Dropping reply with unknown request id {}", id),
                }
            }
            (None, Some(method)) => {
                let _ = notifications.try_send(JsonRpcNotification::new(method, incoming.params));
            }
            _ => debug!("Dropping unsupported SSE message"),
        }
    }

    /// POST 수행: 응답 본문이 JSON이면 바로 라우팅, SSE면 스트림을 소비
    async fn perform_post(
        client: reqwest::Client,
        endpoint: String,
        request: JsonRpcRequest,
        pending: PendingMap,
        notifications: mpsc::Sender<JsonRpcNotification>,
    ) -> Result<()> {
        let response = client
            .post(&endpoint)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    Error::Transport(format!("connection refused: {}", e))
                } else if e.is_timeout() {
                    Error::Timeout(format!("connect to {}", endpoint))
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("http status {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // POST 응답 자체가 SSE 스트림 (Streamable HTTP)
            let mut buffer = String::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| Error::Transport(format!("sse body error: {}", e)))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data:") {
                        Self::route_incoming(data.trim(), &pending, &notifications);
                    }
                }
            }
        } else if content_type.starts_with("application/json") {
            let body = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("body read error: {}", e)))?;
            Self::route_incoming(&body, &pending, &notifications);
        }
        // 그 외(202 Accepted 등): 응답은 GET SSE 스트림으로 도착

        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn remove_pending(&self, id: u64) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(&id);
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::Transport("transport closed".to_string()));
        }

        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        // POST는 별도 태스크로: 본문 소비 중에도 pending 채널로 응답을 받는다
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let pending = Arc::clone(&self.pending);
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            if let Err(e) =
                Self::perform_post(client, endpoint, request, Arc::clone(&pending), notifications)
                    .await
            {
                error!("MCP POST failed: {}", e);
                let sender = pending.lock().expect("pending map poisoned").remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(Err(e));
                }
            }
        });

        tokio::select! {
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) => Err(Error::Transport("response channel closed".to_string())),
            },
            _ = tokio::time::sleep(deadline) => {
                self.remove_pending(id);
                Err(Error::Timeout(format!("{} after {:?}", method, deadline)))
            }
            _ = cancel.cancelled() => {
                let _ = self
                    .notify(
                        "notifications/cancelled",
                        Some(serde_json::json!({ "requestId": id })),
                    )
                    .await;
                self.remove_pending(id);
                Err(Error::Cancelled)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::Transport("transport closed".to_string()));
        }

        let notification = JsonRpcNotification::new(method, params);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("notify failed: {}", e)))?;

        if !response.status().is_success() && response.status().as_u16() != 202 {
            return Err(Error::Transport(format!(
                "http status {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        let mut map = self.pending.lock().expect("pending map poisoned");
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(Error::Transport("transport closed".to_string())));
        }

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ============================================================================
// 테스트
// ============================================================================
