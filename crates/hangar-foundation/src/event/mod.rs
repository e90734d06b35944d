//! Event System - 도메인 이벤트 타입과 버스
//!
//! 코어의 상태 전이(Provider 수명주기, 서킷 전환, 배치 완료)를 구독자
//! (메트릭, 감사 로그, 대시보드)에게 전달합니다. 프로세스 내 best-effort
//! 전달이며 발행자는 블로킹되지 않습니다.

mod bus;
mod types;

pub use bus::{EventBus, EventBusConfig, EventListener, ListenerId};
pub use types::{batch, circuit, group, health, provider, system, tool};
pub use types::{EventCategory, EventId, HangarEvent};
