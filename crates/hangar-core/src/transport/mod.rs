//! Process Transport - 전송 계층 구현
//!
//! 백엔드 MCP 서버와의 통신을 위한 전송 계층. 세 가지 변형이 하나의
//! 계약(`Transport`)을 공유합니다:
//!
//! - `stdio`: 자식 프로세스와 개행 구분 JSON-RPC 2.0 통신
//! - `container`: 컨테이너 런타임(podman/docker)으로 실행하는 stdio 변형
//! - `http`: Streamable-HTTP/SSE 원격 엔드포인트
//!
//! 요청 id는 전송별로 단조 증가하며 응답은 id로 매칭됩니다. 알 수 없는 id의
//! 응답은 버리고 로그만 남기며, 서버 발신 알림은 세션 레벨 핸들러로
//! 전달됩니다.

mod container;
mod http;
mod stdio;

pub use container::{detect_container_runtime, ContainerTransport, VOLUME_DENY_LIST};
pub use http::HttpTransport;
pub use stdio::StdioTransport;

use crate::config::{Mode, ProviderSpec};
use async_trait::async_trait;
use hangar_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 세션 레벨 알림 채널 용량
pub(crate) const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// JSON-RPC 2.0 메시지
// ============================================================================

/// JSON-RPC 2.0 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 에러 객체
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 알림 (응답 없음)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// 수신 라인의 분류용 범용 메시지
///
/// 응답(id + result/error), 알림(method, id 없음), 서버 발신 요청(id + method)을
/// 구분합니다.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JsonRpcIncoming {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    pub method: Option<String>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub params: Option<Value>,
}

/// 응답의 result/error를 Result로 변환
pub(crate) fn unwrap_response(result: Option<Value>, error: Option<JsonRpcError>) -> Result<Value> {
    if let Some(error) = error {
        return Err(Error::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    Ok(result.unwrap_or(Value::Null))
}

// ============================================================================
// Transport trait
// ============================================================================

/// 전송 계층 공통 계약
///
/// 모든 블로킹 연산은 데드라인과 취소 토큰을 받습니다.
#[async_trait]
pub trait Transport: Send + Sync {
    /// 요청 전송 및 응답 수신
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value>;

    /// 알림 전송 (응답 없음)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// 연결 종료 (정상 종료 시도 후 유예 기간 내 강제 종료)
    async fn close(&self) -> Result<()>;

    /// 연결 상태 확인
    fn is_alive(&self) -> bool;

    /// 진단용 stderr 꼬리 (stdio 계열만 내용이 있음)
    fn stderr_tail(&self) -> Vec<String> {
        Vec::new()
    }
}

// ============================================================================
// TransportFactory - 모드별 전송 생성
// ============================================================================

/// 전송 생성 결과
pub struct TransportHandle {
    pub transport: std::sync::Arc<dyn Transport>,
    /// 서버 발신 알림 수신 채널 (tools/list_changed 등)
    pub notifications: mpsc::Receiver<JsonRpcNotification>,
}

/// 전송 생성 seam
///
/// Provider Manager는 이 trait을 통해서만 전송을 만듭니다. 테스트에서는
/// mock 구현으로 교체합니다.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, spec: &ProviderSpec) -> Result<TransportHandle>;
}

/// 실제 전송을 생성하는 기본 팩토리
#[derive(Debug, Default)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(&self, spec: &ProviderSpec) -> Result<TransportHandle> {
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let transport: std::sync::Arc<dyn Transport> = match spec.mode {
            Mode::Subprocess => {
                let (command, args) = spec
                    .command
                    .split_first()
                    .ok_or_else(|| Error::Config(format!("provider '{}': empty command", spec.id)))?;
                std::sync::Arc::new(
                    StdioTransport::spawn(command, args, &spec.env, notif_tx).await?,
                )
            }
            Mode::Container => {
                std::sync::Arc::new(ContainerTransport::launch(spec, notif_tx).await?)
            }
            Mode::Remote => {
                let endpoint = spec
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("provider '{}': missing endpoint", spec.id)))?;
                std::sync::Arc::new(HttpTransport::connect(endpoint, &spec.http, notif_tx).await?)
            }
            Mode::Group => {
                return Err(Error::Internal(format!(
                    "group '{}' has no transport",
                    spec.id
                )))
            }
        };

        Ok(TransportHandle {
            transport,
            notifications: notif_rx,
        })
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request() {
        let request =
            JsonRpcRequest::new(1, "tools/call", Some(serde_json::json!({"name": "add"})));
        assert_eq!(request.jsonrpc, "2.0");
        assert_eq!(request.id, 1);

        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains("\"tools/call\""));
    }

    #[test]
    fn test_incoming_classification() {
        let response: JsonRpcIncoming =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(response.id, Some(3));
        assert!(response.method.is_none());

        let notification: JsonRpcIncoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert!(notification.id.is_none());
        assert_eq!(
            notification.method.as_deref(),
            Some("notifications/tools/list_changed")
        );
    }

    #[test]
    fn test_unwrap_response_error() {
        let err = unwrap_response(
            None,
            Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        )
        .unwrap_err();

        match err {
            Error::Rpc { code, .. } => assert_eq!(code, -32601),
            other => panic!("unexpected error: {other}"),
        }
    }
}
