//! Provider 상태 머신
//!
//! cold → initializing → ready → (degraded ↔ ready) → dead.
//! 전이는 명시적 테이블로 검증합니다.

use serde::{Deserialize, Serialize};

/// Provider 수명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    /// 시작되지 않음 (프로세스/연결 없음)
    Cold,
    /// 시작 + 핸드셰이크 진행 중
    Initializing,
    /// 세션 초기화 완료, 트래픽 수용
    Ready,
    /// 연속 실패 임계 초과, 로테이션 제외
    Degraded,
    /// 복구 불가 (재시작 예산 소진)
    Dead,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
        }
    }

    /// 유효한 전이인지 확인
    pub fn can_transition_to(self, next: ProviderState) -> bool {
        use ProviderState::*;
        match self {
            Cold => matches!(next, Initializing),
            Initializing => matches!(next, Ready | Degraded | Dead),
            Ready => matches!(next, Degraded | Cold | Dead),
            Degraded => matches!(next, Ready | Initializing | Cold | Dead),
            Dead => matches!(next, Initializing | Cold),
        }
    }

    /// 세션이 존재할 수 있는 상태인지 (ready/degraded)
    pub fn has_session(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
