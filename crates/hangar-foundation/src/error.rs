//! Error types for MCP Hangar
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// MCP Hangar 에러 타입
///
/// `kind()`가 반환하는 문자열은 클라이언트에 노출되는 안정적인 에러 코드이며
/// 메트릭 라벨로도 사용됩니다. Single-flight 시작 결과를 대기자들과 공유하기
/// 위해 `Clone`을 구현합니다 (io/json 에러는 메시지로 보존).
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 대상 해석 관련
    // ========================================================================
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Unknown tool: '{tool}' not in catalog of '{provider}'")]
    UnknownTool { provider: String, tool: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ========================================================================
    // Provider 런타임 관련
    // ========================================================================
    #[error("Cold start failed: {provider} - {message}")]
    ColdStartFailed { provider: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // Dispatch 관련
    // ========================================================================
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Group unavailable: {group} - {message}")]
    GroupUnavailable { group: String, message: String },

    /// 백엔드가 반환한 애플리케이션 레벨 도구 에러
    #[error("Tool error: {provider}/{tool} - {message}")]
    Tool {
        provider: String,
        tool: String,
        message: String,
    },

    /// 백엔드가 반환한 JSON-RPC 에러 객체 (프로토콜 레벨)
    ///
    /// 호출 맥락을 아는 상위 레이어(Session, Manager)에서 구체적인 에러로
    /// 변환됩니다.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 클라이언트에 노출되는 안정적인 에러 코드
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::UnknownTarget(_) => "unknown_target",
            Error::UnknownTool { .. } => "unknown_tool",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::ColdStartFailed { .. } => "provider_cold_start_failed",
            Error::Transport(_) | Error::Io(_) => "transport_error",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::RateLimited(_) => "rate_limited",
            Error::CircuitOpen(_) => "circuit_open",
            Error::GroupUnavailable { .. } => "group_unavailable",
            Error::Tool { .. } | Error::Rpc { .. } => "tool_error",
            Error::Json(_) => "framing_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// JSON-RPC 에러 객체에 사용하는 숫자 코드
    pub fn code(&self) -> i32 {
        match self {
            Error::Config(_) => -32001,
            Error::UnknownTarget(_) => -32002,
            Error::UnknownTool { .. } => -32003,
            Error::InvalidArgument(_) => -32602,
            Error::ColdStartFailed { .. } => -32004,
            Error::Transport(_) | Error::Io(_) => -32005,
            Error::Timeout(_) => -32006,
            Error::Cancelled => -32007,
            Error::RateLimited(_) => -32008,
            Error::CircuitOpen(_) => -32009,
            Error::GroupUnavailable { .. } => -32010,
            Error::Tool { .. } => -32011,
            Error::Rpc { code, .. } => *code,
            Error::Json(_) => -32700,
            Error::Internal(_) => -32603,
        }
    }

    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Io(_)
                | Error::RateLimited(_)
                | Error::CircuitOpen(_)
                | Error::GroupUnavailable { .. }
        )
    }

    /// Health Tracker / Circuit Breaker의 실패 카운트에 포함되는지 확인
    ///
    /// 백엔드 도구 에러(`tool_error`)는 전송 결과가 아니라 도구 결과이므로
    /// 제외합니다. unknown_tool/invalid_argument 같은 호출자 실수도 제외.
    pub fn counts_for_health(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Io(_)
                | Error::Timeout(_)
                | Error::ColdStartFailed { .. }
                | Error::Json(_)
        )
    }

    /// Cold start 에러 생성 헬퍼
    pub fn cold_start(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ColdStartFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Tool 에러 생성 헬퍼
    pub fn tool(
        provider: impl Into<String>,
        tool: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Tool {
            provider: provider.into(),
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(Error::UnknownTarget("x".into()).kind(), "unknown_target");
        assert_eq!(Error::Timeout("x".into()).kind(), "timeout");
        assert_eq!(Error::CircuitOpen("g".into()).kind(), "circuit_open");
        assert_eq!(
            Error::cold_start("p", "boom").kind(),
            "provider_cold_start_failed"
        );
    }

    #[test]
    fn test_health_accounting() {
        // 전송/타임아웃/콜드스타트는 health 실패로 집계
        assert!(Error::Transport("refused".into()).counts_for_health());
        assert!(Error::Timeout("5s".into()).counts_for_health());
        assert!(Error::cold_start("p", "x").counts_for_health());

        // 도구 결과와 호출자 실수는 집계 제외
        assert!(!Error::tool("p", "t", "bad input").counts_for_health());
        assert!(!Error::UnknownTool {
            provider: "p".into(),
            tool: "t".into()
        }
        .counts_for_health());
        assert!(!Error::Cancelled.counts_for_health());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Transport("x".into()).is_retryable());
        assert!(Error::RateLimited("x".into()).is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
