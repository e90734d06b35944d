//! Event Types - 코어 전체에서 발생하는 도메인 이벤트 정의

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// 새 이벤트 ID 생성
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

/// 이벤트 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Provider 수명주기 이벤트 (시작, 준비, 종료)
    Provider,
    /// 헬스 체크 이벤트
    Health,
    /// 서킷 브레이커 이벤트
    Circuit,
    /// 그룹 상태 이벤트
    Group,
    /// 도구 호출 이벤트
    Tool,
    /// 배치 실행 이벤트
    Batch,
    /// 시스템 이벤트 (기동, 종료, 설정 리로드)
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Health => "health",
            Self::Circuit => "circuit",
            Self::Group => "group",
            Self::Tool => "tool",
            Self::Batch => "batch",
            Self::System => "system",
        }
    }
}

// ============================================================================
// HangarEvent - 핵심 이벤트 타입
// ============================================================================

/// Hangar 도메인 이벤트
///
/// 모든 구독자(메트릭, 감사 로그, 대시보드)가 공유하는 공통 구조입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HangarEvent {
    /// 이벤트 ID
    pub id: EventId,

    /// 이벤트 타입 (예: "provider.ready", "circuit.opened")
    pub event_type: String,

    /// 이벤트 카테고리
    pub category: EventCategory,

    /// 이벤트 발생 시간
    pub timestamp: DateTime<Utc>,

    /// 관련 provider/group ID (있는 경우)
    pub subject: Option<String>,

    /// 이벤트 데이터
    pub data: Value,
}

impl HangarEvent {
    /// 새 이벤트 생성
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            timestamp: Utc::now(),
            subject: None,
            data: Value::Null,
        }
    }

    /// 대상 설정
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// 데이터 설정
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// 사전 정의된 이벤트 타입들
// ============================================================================

/// Provider 수명주기 이벤트
pub mod provider {
    use super::*;

    /// 시작 중 (cold → initializing)
    pub fn starting(provider: &str, mode: &str) -> HangarEvent {
        HangarEvent::new("provider.starting", EventCategory::Provider)
            .with_subject(provider)
            .with_data(serde_json::json!({ "mode": mode }))
    }

    /// 준비 완료 (handshake + 도구 발견 성공)
    pub fn ready(provider: &str, mode: &str, tools_count: usize, startup_ms: u64) -> HangarEvent {
        HangarEvent::new("provider.ready", EventCategory::Provider)
            .with_subject(provider)
            .with_data(serde_json::json!({
                "mode": mode,
                "tools_count": tools_count,
                "startup_ms": startup_ms,
            }))
    }

    /// 연속 실패로 degraded 전환
    pub fn degraded(provider: &str, consecutive_failures: u32, reason: &str) -> HangarEvent {
        HangarEvent::new("provider.degraded", EventCategory::Provider)
            .with_subject(provider)
            .with_data(serde_json::json!({
                "consecutive_failures": consecutive_failures,
                "reason": reason,
            }))
    }

    /// degraded에서 복구
    pub fn recovered(provider: &str) -> HangarEvent {
        HangarEvent::new("provider.recovered", EventCategory::Provider).with_subject(provider)
    }

    /// 종료 (idle GC 또는 명시적 종료)
    pub fn stopped(provider: &str, reason: &str) -> HangarEvent {
        HangarEvent::new("provider.stopped", EventCategory::Provider)
            .with_subject(provider)
            .with_data(serde_json::json!({ "reason": reason }))
    }
}

/// 헬스 체크 이벤트
pub mod health {
    use super::*;

    pub fn probe_passed(provider: &str, duration_ms: u64) -> HangarEvent {
        HangarEvent::new("health.probe_passed", EventCategory::Health)
            .with_subject(provider)
            .with_data(serde_json::json!({ "duration_ms": duration_ms }))
    }

    pub fn probe_failed(provider: &str, consecutive_failures: u32, error: &str) -> HangarEvent {
        HangarEvent::new("health.probe_failed", EventCategory::Health)
            .with_subject(provider)
            .with_data(serde_json::json!({
                "consecutive_failures": consecutive_failures,
                "error": error,
            }))
    }
}

/// 서킷 브레이커 이벤트
pub mod circuit {
    use super::*;

    pub fn opened(group: &str, failure_count: u32) -> HangarEvent {
        HangarEvent::new("circuit.opened", EventCategory::Circuit)
            .with_subject(group)
            .with_data(serde_json::json!({ "failure_count": failure_count }))
    }

    pub fn reset(group: &str) -> HangarEvent {
        HangarEvent::new("circuit.reset", EventCategory::Circuit).with_subject(group)
    }
}

/// 그룹 이벤트
pub mod group {
    use super::*;

    pub fn state_changed(group: &str, available: bool, healthy: usize, total: usize) -> HangarEvent {
        HangarEvent::new("group.state_changed", EventCategory::Group)
            .with_subject(group)
            .with_data(serde_json::json!({
                "available": available,
                "healthy_count": healthy,
                "total_members": total,
            }))
    }
}

/// 도구 호출 이벤트
pub mod tool {
    use super::*;

    pub fn invoked(
        provider: &str,
        tool: &str,
        correlation_id: &str,
        duration_ms: u64,
    ) -> HangarEvent {
        HangarEvent::new("tool.invoked", EventCategory::Tool)
            .with_subject(provider)
            .with_data(serde_json::json!({
                "tool": tool,
                "correlation_id": correlation_id,
                "duration_ms": duration_ms,
            }))
    }

    pub fn failed(
        provider: &str,
        tool: &str,
        correlation_id: &str,
        error_kind: &str,
        duration_ms: u64,
    ) -> HangarEvent {
        HangarEvent::new("tool.failed", EventCategory::Tool)
            .with_subject(provider)
            .with_data(serde_json::json!({
                "tool": tool,
                "correlation_id": correlation_id,
                "error_kind": error_kind,
                "duration_ms": duration_ms,
            }))
    }
}

/// 배치 실행 이벤트
pub mod batch {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    pub fn completed(
        batch_id: &str,
        total: usize,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
        breaker_rejections: usize,
        duration_ms: u64,
    ) -> HangarEvent {
        HangarEvent::new("batch.completed", EventCategory::Batch)
            .with_subject(batch_id)
            .with_data(serde_json::json!({
                "total": total,
                "succeeded": succeeded,
                "failed": failed,
                "cancelled": cancelled,
                "breaker_rejections": breaker_rejections,
                "duration_ms": duration_ms,
            }))
    }
}

/// 시스템 이벤트
pub mod system {
    use super::*;

    pub fn started(version: &str, providers: usize, groups: usize) -> HangarEvent {
        HangarEvent::new("system.started", EventCategory::System).with_data(serde_json::json!({
            "version": version,
            "providers": providers,
            "groups": groups,
        }))
    }

    pub fn shutdown(reason: &str) -> HangarEvent {
        HangarEvent::new("system.shutdown", EventCategory::System)
            .with_data(serde_json::json!({ "reason": reason }))
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn test_provider_events() {
        let event = provider::ready("math", "subprocess", 3, 120);
        assert_eq!(event.event_type, "provider.ready");
        assert_eq!(event.category, EventCategory::Provider);
        assert_eq!(event.subject.as_deref(), Some("math"));
        assert_eq!(event.data["tools_count"], 3);
    }

    #[test]
    fn test_circuit_events() {
        let event = circuit::opened("llm-group", 5);
        assert_eq!(event.event_type, "circuit.opened");
        assert_eq!(event.data["failure_count"], 5);
    }

    #[test]
    fn test_event_serializes() {
        let event = tool::invoked("math", "add", "c-1", 10);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "tool");
    }
}
