//! hangar-core: Provider Runtime for MCP Hangar
//!
//! MCP 게이트웨이의 코어 런타임. provider 수명주기, health, 서킷 브레이커,
//! 그룹 라우팅, 디스패치, 배치 fan-out을 담당합니다.
//!
//! # 주요 모듈
//!
//! - `config`: 설정 스키마와 로더
//! - `transport`: stdio/container/http 전송 (JSON-RPC 2.0)
//! - `session`: MCP 핸드셰이크와 도구 카탈로그
//! - `provider`: provider 상태 머신, health, 수명주기 매니저
//! - `group`: 그룹, 서킷 브레이커, 로드 밸런서
//! - `registry`: provider/group 색인
//! - `dispatch`: 단일 호출 진입점
//! - `batch`: 병렬 fan-out 실행기
//! - `worker`: 헬스 프로브/Idle GC 백그라운드 워커
//! - `metrics`: 이벤트 구독 기반 메트릭 집계
//!
//! # 사용 예시
//!
//! ```ignore
//! use hangar_core::{ConfigLoader, DispatchEngine, DispatchRequest, Registry};
//! use hangar_core::transport::DefaultTransportFactory;
//! use hangar_foundation::EventBus;
//! use std::sync::Arc;
//!
//! let config = ConfigLoader::new(None).load()?;
//! let events = Arc::new(EventBus::new());
//! let registry = Arc::new(Registry::from_config(
//!     &config,
//!     Arc::new(DefaultTransportFactory),
//!     Arc::clone(&events),
//! )?);
//! let dispatch = DispatchEngine::new(registry, &config.rate_limit, &config.concurrency);
//!
//! let result = dispatch
//!     .dispatch(DispatchRequest::new("math", "add", serde_json::json!({"a": 1, "b": 2})), &cancel)
//!     .await?;
//! ```

pub mod audit;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod group;
pub mod metrics;
pub mod provider;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod session;
pub mod single_flight;
pub mod testing;
pub mod transport;
pub mod worker;

// Re-exports: Config
pub use config::{
    ConfigLoader, GroupSpec, HangarConfig, Mode, ProviderSpec, Strategy, CONFIG_ENV_VAR,
    CONFIG_FILE_NAME,
};

// Re-exports: Runtime
pub use batch::{BatchCall, BatchCallResult, BatchExecutor, BatchOptions, BatchResult};
pub use dispatch::{DispatchEngine, DispatchRequest, DEFAULT_INVOKE_DEADLINE};
pub use group::{CircuitMode, GroupStatus, ProviderGroup};
pub use metrics::MetricsCollector;
pub use provider::{HealthSnapshot, ProviderManager, ProviderState, ProviderStatus};
pub use registry::{Registry, Target};
pub use session::{ProviderSession, ToolDescriptor};
pub use worker::{HealthWorker, IdleGcWorker};

// Layer1 re-exports
pub use hangar_foundation::{Error, EventBus, ProviderId, Result};

/// Core 버전
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_config_exports() {
        let config = HangarConfig::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.concurrency.global_limit, 50);
    }
}
