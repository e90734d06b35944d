//! Stdio Transport - 자식 프로세스 기반 통신
//!
//! 자식 프로세스의 stdin/stdout으로 개행 구분 JSON-RPC 2.0을 주고받습니다.
//! stderr는 진단용 링 버퍼로 수집합니다.

use super::{
    unwrap_response, JsonRpcIncoming, JsonRpcNotification, JsonRpcRequest, Transport,
};
use async_trait::async_trait;
use hangar_foundation::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// stderr 링 버퍼 최대 라인 수
const STDERR_RING_CAPACITY: usize = 100;

/// 정상 종료 유예 기간
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport").finish_non_exhaustive()
    }
}

/// Stdio Transport
pub struct StdioTransport {
    /// 요청 ID 카운터
    request_id: AtomicU64,

    /// stdin writer 채널
    stdin_tx: mpsc::Sender<String>,

    /// 대기 중인 요청들 (id → response sender)
    pending: PendingMap,

    /// 연결 상태
    connected: Arc<AtomicBool>,

    /// 프로세스 종료 신호 (supervisor 태스크로)
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,

    /// 종료 상태 (프로세스가 끝났으면 기록됨)
    exit_status: Arc<StdMutex<Option<String>>>,

    /// stderr 링 버퍼
    stderr_ring: Arc<StdMutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// 새 stdio transport 생성 및 프로세스 시작
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        notifications: mpsc::Sender<JsonRpcNotification>,
    ) -> Result<Self> {
        info!("Spawning MCP process: {} {:?}", command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("failed to capture stderr".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let exit_status = Arc::new(StdMutex::new(None));
        let stderr_ring = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

        // stdin writer 태스크
        let connected_for_writer = Arc::clone(&connected);
        let mut stdin_writer = stdin;
        tokio::spawn(async move {
            while let Some(msg) = stdin_rx.recv().await {
                if let Err(e) = stdin_writer.write_all(msg.as_bytes()).await {
                    error!("Failed to write to child stdin: {}", e);
                    connected_for_writer.store(false, Ordering::SeqCst);
                    break;
                }
                if let Err(e) = stdin_writer.flush().await {
                    error!("Failed to flush child stdin: {}", e);
                    connected_for_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // stdout reader 태스크: 응답/알림 분류
        let pending_for_reader = Arc::clone(&pending);
        let connected_for_reader = Arc::clone(&connected);
        let mut reader = BufReader::new(stdout).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = reader.next_line().await {
                Self::route_incoming(&line, &pending_for_reader, &notifications);
            }
            connected_for_reader.store(false, Ordering::SeqCst);

            // 남아있는 대기자들 정리
            let mut map = pending_for_reader.lock().expect("pending map poisoned");
            for (_, tx) in map.drain() {
                let _ = tx.send(Err(Error::Transport("process exited".to_string())));
            }
            debug!("MCP stdout reader finished");
        });

        // stderr reader 태스크: 링 버퍼에 수집
        let ring_for_reader = Arc::clone(&stderr_ring);
        let mut err_reader = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = err_reader.next_line().await {
                debug!("MCP stderr: {}", line);
                let mut ring = ring_for_reader.lock().expect("stderr ring poisoned");
                if ring.len() >= STDERR_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });

        // supervisor 태스크: 자발적 종료 감지 + 종료 신호 처리
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let connected_for_supervisor = Arc::clone(&connected);
        let exit_for_supervisor = Arc::clone(&exit_status);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    // 유예 기간 내 자발적 종료 대기 후 강제 종료
                    match timeout(SHUTDOWN_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!("Child did not exit within grace period, killing");
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
            };

            let text = match status {
                Ok(s) => s.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            debug!("MCP process exited: {}", text);
            *exit_for_supervisor.lock().expect("exit status poisoned") = Some(text);
            connected_for_supervisor.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            request_id: AtomicU64::new(1),
            stdin_tx,
            pending,
            connected,
            kill_tx: StdMutex::new(Some(kill_tx)),
            exit_status,
            stderr_ring,
        })
    }

    /// 수신 라인을 응답/알림/서버 요청으로 분류
    fn route_incoming(
        line: &str,
        pending: &PendingMap,
        notifications: &mpsc::Sender<JsonRpcNotification>,
    ) {
        let incoming: JsonRpcIncoming = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Non-JSON-RPC line from child: {}", e);
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
                    None => {
                        // 취소됐거나 모르는 id: 버리고 로그만 남김
                        debug!("Dropping reply with unknown request id {}", id);
                    }
                }
            }
            (None, Some(method)) => {
                let notification = JsonRpcNotification::new(method, incoming.params);
                if notifications.try_send(notification).is_err() {
                    debug!("Notification channel full or closed, dropping");
                }
            }
            (Some(id), Some(method)) => {
                warn!(
                    "Dropping server-initiated request '{}' (id {}), not supported",
                    method, id
                );
            }
            (None, None) => {
                debug!("Dropping JSON-RPC message with neither id nor method");
            }
        }
    }

    /// 다음 요청 ID 생성
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 프로세스 종료 이유 (진단용)
    fn disconnect_reason(&self) -> String {
        match self.exit_status.lock().expect("exit status poisoned").clone() {
            Some(status) => format!("process exited with {}", status),
            None => "transport not connected".to_string(),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::Transport(self.disconnect_reason()));
        }

        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        let msg = serde_json::to_string(&request)?;
        debug!("Sending MCP request #{}: {}", id, method);

        if self.stdin_tx.send(format!("{}\n", msg)).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(Error::Transport(self.disconnect_reason()));
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(self.disconnect_reason())),
            },
            _ = tokio::time::sleep(deadline) => {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                Err(Error::Timeout(format!("{} after {:?}", method, deadline)))
            }
            _ = cancel.cancelled() => {
                // best-effort 취소 알림; 서버가 응답할 때까지 id는 소모된 채로 남음
                let _ = self
                    .notify(
                        "notifications/cancelled",
                        Some(serde_json::json!({ "requestId": id })),
                    )
                    .await;
                Err(Error::Cancelled)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::Transport(self.disconnect_reason()));
        }

        let notification = JsonRpcNotification::new(method, params);
        let msg = serde_json::to_string(&notification)?;

        self.stdin_tx
            .send(format!("{}\n", msg))
            .await
            .map_err(|_| Error::Transport(self.disconnect_reason()))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // 초기화된 서버에게 정상 종료 기회를 준다
        let _ = self.notify("shutdown", None).await;

        self.connected.store(false, Ordering::SeqCst);

        let kill_tx = self.kill_tx.lock().expect("kill channel poisoned").take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr_ring
            .lock()
            .expect("stderr ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with_entry(id: u64) -> (PendingMap, oneshot::Receiver<Result<Value>>) {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);
        (pending, rx)
    }

    #[tokio::test]
    async fn test_route_reply_to_pending() {
        let (pending, rx) = pending_with_entry(7);
        let (notif_tx, _notif_rx) = mpsc::channel(4);

        StdioTransport::route_incoming(
            r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#,
            &pending,
            &notif_tx,
        );

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["tools"], serde_json::json!([]));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let (pending, _rx) = pending_with_entry(1);
        let (notif_tx, _notif_rx) = mpsc::channel(4);

        // id 99는 아무도 기다리지 않음
        StdioTransport::route_incoming(
            r#"{"jsonrpc":"2.0","id":99,"result":null}"#,
            &pending,
            &notif_tx,
        );

        assert_eq!(pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_routed_to_channel() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (notif_tx, mut notif_rx) = mpsc::channel(4);

        StdioTransport::route_incoming(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
            &pending,
            &notif_tx,
        );

        let notification = notif_rx.recv().await.unwrap();
        assert_eq!(notification.method, "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn test_rpc_error_reply() {
        let (pending, rx) = pending_with_entry(2);
        let (notif_tx, _notif_rx) = mpsc::channel(4);

        StdioTransport::route_incoming(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
            &pending,
            &notif_tx,
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Rpc { code: -32601, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_echo_server_roundtrip() {
        // 한 줄 읽어 같은 id로 응답하는 초소형 서버
        let script = r#"
import sys, json
for line in sys.stdin:
    req = json.loads(line)
    resp = {"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;
        let (notif_tx, _notif_rx) = mpsc::channel(4);
        let transport = StdioTransport::spawn(
            "python3",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
            notif_tx,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let value = transport
            .request("tools/list", None, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(value["echo"], "tools/list");

        transport.close().await.unwrap();
        // supervisor가 종료를 기록할 때까지 잠시 대기
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transport.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let (notif_tx, _notif_rx) = mpsc::channel(4);
        let err = StdioTransport::spawn(
            "definitely-not-a-real-binary-xyz",
            &[],
            &HashMap::new(),
            notif_tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "transport_error");
    }
}
