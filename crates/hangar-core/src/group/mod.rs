//! Provider Group - 라우팅 전략과 서킷 브레이커를 공유하는 멤버 집합
//!
//! 그룹은 멤버를 `ProviderId`로만 참조합니다 (소유하지 않음). 멤버 상태
//! 스냅샷은 디스패치 시점에 Registry가 만들어 넘깁니다.

mod balancer;
mod breaker;

pub use balancer::{Candidate, LoadBalancer};
pub use breaker::{CircuitBreaker, CircuitMode, CircuitTransition};

use crate::config::{GroupSpec, Strategy};
use crate::provider::ProviderState;
use hangar_foundation::event::{circuit as circuit_events, group as group_events};
use hangar_foundation::{Error, EventBus, ProviderId, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::debug;

/// 디스패치 시점의 멤버 관측값
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub id: ProviderId,
    pub weight: u32,
    pub priority: u32,
    pub state: ProviderState,
    pub in_flight: usize,
    pub consecutive_failures: u32,
}

impl MemberSnapshot {
    /// min_healthy 집계에 포함되는지 (세션을 보유한 ready/degraded)
    pub fn counts_healthy(&self) -> bool {
        self.state.has_session()
    }

    /// 로테이션 대상인지 (degraded/dead는 다른 선택지가 없을 때만)
    pub fn in_rotation(&self) -> bool {
        matches!(
            self.state,
            ProviderState::Cold | ProviderState::Initializing | ProviderState::Ready
        )
    }
}

/// 그룹 상태 스냅샷 (registry_list / registry_details용)
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub description: Option<String>,
    pub state: &'static str,
    pub strategy: &'static str,
    pub min_healthy: usize,
    pub healthy_count: usize,
    pub total_members: usize,
    pub is_available: bool,
    pub circuit_state: &'static str,
    pub members: Vec<GroupMemberStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMemberStatus {
    pub id: String,
    pub state: ProviderState,
    pub in_rotation: bool,
    pub weight: u32,
    pub priority: u32,
    pub in_flight: usize,
    pub consecutive_failures: u32,
}

impl std::fmt::Debug for ProviderGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGroup").finish_non_exhaustive()
    }
}

/// Provider Group
pub struct ProviderGroup {
    spec: GroupSpec,
    breaker: CircuitBreaker,
    balancer: LoadBalancer,
    events: Arc<EventBus>,

    /// 마지막으로 관측한 가용성 (상태 변화 이벤트 발행용)
    last_available: StdMutex<Option<bool>>,
}

impl ProviderGroup {
    pub fn new(spec: GroupSpec, events: Arc<EventBus>) -> Self {
        let breaker = CircuitBreaker::new(
            spec.circuit_breaker.failure_threshold,
            Duration::from_secs_f64(spec.circuit_breaker.reset_timeout_s),
        );
        let balancer = LoadBalancer::new(spec.strategy);

        Self {
            spec,
            breaker,
            balancer,
            events,
            last_available: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.spec.id
    }

    pub fn spec(&self) -> &GroupSpec {
        &self.spec
    }

    pub fn strategy(&self) -> Strategy {
        self.spec.strategy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 디스패치 가능한 멤버 선택
    ///
    /// 순서: min_healthy 게이트 → 로테이션 집합 → 서킷 브레이커 → 전략 선택.
    /// ready/cold 멤버가 없으면 degraded, 그것도 없으면 dead 멤버를
    /// 재시작 후보로 선택해 트래픽으로 복구를 시도합니다.
    pub fn pick_member(&self, members: &[MemberSnapshot]) -> Result<ProviderId> {
        let healthy = members.iter().filter(|m| m.counts_healthy()).count();
        let available = healthy >= self.spec.min_healthy;
        self.note_availability(available, healthy, members.len());

        if !available {
            return Err(Error::GroupUnavailable {
                group: self.spec.id.to_string(),
                message: format!(
                    "healthy members {} below min_healthy {}",
                    healthy, self.spec.min_healthy
                ),
            });
        }

        let mut candidates: Vec<Candidate> = members
            .iter()
            .filter(|m| m.in_rotation())
            .map(member_to_candidate)
            .collect();

        if candidates.is_empty() {
            candidates = members
                .iter()
                .filter(|m| m.state == ProviderState::Degraded)
                .map(member_to_candidate)
                .collect();
        }

        if candidates.is_empty() {
            // dead 멤버뿐이면 재시작을 시도할 후보로 취급
            candidates = members
                .iter()
                .filter(|m| m.state == ProviderState::Dead)
                .map(member_to_candidate)
                .collect();
        }

        if candidates.is_empty() {
            return Err(Error::GroupUnavailable {
                group: self.spec.id.to_string(),
                message: "no members in rotation".to_string(),
            });
        }

        if let Err(retry_after) = self.breaker.try_acquire() {
            return Err(Error::CircuitOpen(format!(
                "{} (retry in {:.1}s)",
                self.spec.id,
                retry_after.as_secs_f64()
            )));
        }

        match self.balancer.select(&candidates) {
            Some(member) => {
                debug!("Group '{}' selected member '{}'", self.spec.id, member);
                Ok(member)
            }
            None => {
                self.breaker.cancel_probe();
                Err(Error::GroupUnavailable {
                    group: self.spec.id.to_string(),
                    message: "no members in rotation".to_string(),
                })
            }
        }
    }

    /// 멤버 호출 결과를 브레이커에 반영
    ///
    /// `counts` false인 결과(도구 에러 등)는 브레이커에 영향을 주지 않지만
    /// half-open 프로브 슬롯은 반납합니다.
    pub fn record_outcome(&self, success: bool, counts: bool) {
        let transition = if success {
            self.breaker.record_success()
        } else if counts {
            self.breaker.record_failure()
        } else {
            self.breaker.cancel_probe();
            None
        };

        match transition {
            Some(CircuitTransition::Opened) => {
                self.events.publish(circuit_events::opened(
                    self.spec.id.as_str(),
                    self.breaker.failure_count(),
                ));
            }
            Some(CircuitTransition::Reset) => {
                self.events
                    .publish(circuit_events::reset(self.spec.id.as_str()));
            }
            None => {}
        }
    }

    /// 가용성 변화 관측 (변할 때만 이벤트 발행)
    fn note_availability(&self, available: bool, healthy: usize, total: usize) {
        let mut last = self.last_available.lock().expect("availability poisoned");
        if *last != Some(available) {
            *last = Some(available);
            self.events.publish(group_events::state_changed(
                self.spec.id.as_str(),
                available,
                healthy,
                total,
            ));
        }
    }

    /// 그룹 상태 스냅샷
    pub fn status(&self, members: &[MemberSnapshot]) -> GroupStatus {
        let healthy = members.iter().filter(|m| m.counts_healthy()).count();
        let circuit = self.breaker.mode();
        let available = healthy >= self.spec.min_healthy && circuit != CircuitMode::Open;

        GroupStatus {
            group_id: self.spec.id.to_string(),
            description: self.spec.description.clone(),
            state: if available { "ready" } else { "unavailable" },
            strategy: self.spec.strategy.as_str(),
            min_healthy: self.spec.min_healthy,
            healthy_count: healthy,
            total_members: members.len(),
            is_available: available,
            circuit_state: circuit.as_str(),
            members: members
                .iter()
                .map(|m| GroupMemberStatus {
                    id: m.id.to_string(),
                    state: m.state,
                    in_rotation: m.in_rotation(),
                    weight: m.weight,
                    priority: m.priority,
                    in_flight: m.in_flight,
                    consecutive_failures: m.consecutive_failures,
                })
                .collect(),
        }
    }
}

fn member_to_candidate(m: &MemberSnapshot) -> Candidate {
    Candidate {
        id: m.id.clone(),
        weight: m.weight,
        priority: m.priority,
        in_flight: m.in_flight,
    }
}

// ============================================================================
// 테스트
// ============================================================================
