//! Provider Session - 초기화된 MCP 세션
//!
//! 전송 하나를 소유하고 MCP 핸드셰이크를 수행한 뒤 도구 카탈로그를
//! 캐싱합니다. `tools/list_changed` 알림을 받으면 캐시를 무효화합니다.

use crate::config::DeclaredTool;
use crate::transport::{JsonRpcNotification, Transport};
use hangar_foundation::{Error, ProviderId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// MCP 프로토콜 버전
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// 핸드셰이크 단계별 타임아웃
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 카탈로그 갱신 타임아웃
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Tool Catalog
// ============================================================================

/// 백엔드가 노출하는 도구 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// 도구 이름
    pub name: String,

    /// 도구 설명
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 입력 스키마 (JSON Schema)
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<&DeclaredTool> for ToolDescriptor {
    fn from(declared: &DeclaredTool) -> Self {
        Self {
            name: declared.name.clone(),
            description: declared.description.clone(),
            input_schema: declared.input_schema.clone(),
        }
    }
}

/// 도구 카탈로그 (세션 내부 캐시)
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    fn replace(&mut self, tools: Vec<ToolDescriptor>) {
        self.tools = tools;
    }

    fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    fn count(&self) -> usize {
        self.tools.len()
    }
}

// ============================================================================
// Provider Session
// ============================================================================

/// 초기화된 MCP 세션
///
/// Provider Manager가 ready/degraded 상태인 동안에만 존재합니다.
pub struct ProviderSession {
    provider_id: ProviderId,
    transport: Arc<dyn Transport>,
    catalog: StdRwLock<ToolCatalog>,

    /// tools/list_changed 수신 여부 (다음 조회 전에 갱신)
    catalog_dirty: AtomicBool,

    /// initialize 응답의 result (serverInfo, capabilities)
    server_info: Value,
}

impl ProviderSession {
    /// 핸드셰이크 수행 후 세션 생성
    ///
    /// `initialize` → `notifications/initialized` → `tools/list` 순서로
    /// 진행하며, 실패는 cold start 실패로 분류됩니다.
    pub async fn establish(
        provider_id: ProviderId,
        transport: Arc<dyn Transport>,
        mut notifications: mpsc::Receiver<JsonRpcNotification>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let init_result = transport
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-hangar",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
                HANDSHAKE_TIMEOUT,
                cancel,
            )
            .await
            .map_err(|e| handshake_error(&provider_id, "initialize", e))?;

        transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| handshake_error(&provider_id, "initialized", e))?;

        let tools_result = transport
            .request("tools/list", None, HANDSHAKE_TIMEOUT, cancel)
            .await
            .map_err(|e| handshake_error(&provider_id, "tools/list", e))?;

        let tools = parse_tool_list(&tools_result)?;
        info!(
            "Session established for '{}': {} tools",
            provider_id,
            tools.len()
        );

        let session = Arc::new(Self {
            provider_id,
            transport,
            catalog: StdRwLock::new(ToolCatalog { tools }),
            catalog_dirty: AtomicBool::new(false),
            server_info: init_result,
        });

        // 서버 발신 알림 펌프: list_changed만 관심 대상
        let pump = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(session) = pump.upgrade() else { break };
                if notification.method == "notifications/tools/list_changed" {
                    debug!(
                        "Tool catalog invalidated for '{}'",
                        session.provider_id
                    );
                    session.catalog_dirty.store(true, Ordering::SeqCst);
                } else {
                    debug!(
                        "Ignoring notification '{}' from '{}'",
                        notification.method, session.provider_id
                    );
                }
            }
        });

        Ok(session)
    }

    /// 도구 호출
    ///
    /// 카탈로그에 없는 도구는 전송을 건드리지 않고 `unknown_tool`을
    /// 반환합니다. `list_changed`로 무효화된 카탈로그는 먼저 갱신합니다.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if self.catalog_dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.refresh_tools(cancel).await {
                warn!("Catalog refresh failed for '{}': {}", self.provider_id, e);
            }
        }

        if !self.catalog.read().expect("catalog poisoned").has(tool) {
            return Err(Error::UnknownTool {
                provider: self.provider_id.to_string(),
                tool: tool.to_string(),
            });
        }

        let result = self
            .transport
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": tool, "arguments": arguments })),
                deadline,
                cancel,
            )
            .await
            .map_err(|e| match e {
                // 프로토콜 레벨 에러도 백엔드 도구 결과로 취급
                Error::Rpc { message, .. } => {
                    Error::tool(self.provider_id.as_str(), tool, message)
                }
                other => other,
            })?;

        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = extract_error_text(&result);
            return Err(Error::tool(self.provider_id.as_str(), tool, message));
        }

        Ok(result)
    }

    /// 헬스 프로브 (tools/list를 짧은 데드라인으로 호출)
    pub async fn probe(&self, deadline: Duration, cancel: &CancellationToken) -> Result<usize> {
        let result = self
            .transport
            .request("tools/list", None, deadline, cancel)
            .await?;
        let tools = parse_tool_list(&result)?;
        let count = tools.len();
        self.catalog.write().expect("catalog poisoned").replace(tools);
        Ok(count)
    }

    /// 카탈로그 강제 갱신
    pub async fn refresh_tools(&self, cancel: &CancellationToken) -> Result<usize> {
        self.probe(REFRESH_TIMEOUT, cancel).await
    }

    /// 캐시된 도구 목록
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.read().expect("catalog poisoned").list()
    }

    /// 캐시된 도구 수
    pub fn tools_count(&self) -> usize {
        self.catalog.read().expect("catalog poisoned").count()
    }

    /// initialize 응답 메타데이터
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    /// 전송 생존 여부
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// 진단용 stderr 꼬리
    pub fn stderr_tail(&self) -> Vec<String> {
        self.transport.stderr_tail()
    }

    /// 세션 종료 (전송 닫기)
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// 핸드셰이크 에러 분류
///
/// 전송 자체가 죽은 경우는 transport_error를 유지하고, 백엔드가 응답했지만
/// 거부한 경우는 cold start 실패로 변환합니다.
fn handshake_error(provider_id: &ProviderId, stage: &str, e: Error) -> Error {
    match e {
        Error::Rpc { code, message } => Error::cold_start(
            provider_id.as_str(),
            format!("{} rejected ({}): {}", stage, code, message),
        ),
        Error::Timeout(msg) => {
            Error::cold_start(provider_id.as_str(), format!("{} timed out: {}", stage, msg))
        }
        other => other,
    }
}

/// tools/list 응답 파싱
fn parse_tool_list(result: &Value) -> Result<Vec<ToolDescriptor>> {
    let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
    serde_json::from_value(tools)
        .map_err(|e| Error::Json(format!("invalid tools/list payload: {}", e)))
}

/// 도구 에러 결과에서 텍스트 추출
fn extract_error_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find_map(|item| {
                item.get("text").and_then(Value::as_str).map(str::to_string)
            })
        })
        .unwrap_or_else(|| "tool returned an error".to_string())
}

// ============================================================================
// 테스트
// ============================================================================
