//! Dispatch Engine - 단일 호출 진입점
//!
//! 대상 해석 → 속도 제한 → (그룹이면 브레이커/로드밸런서) → provider 호출 →
//! 결과 기록. 모든 호출 결과는 이벤트 버스로 발행됩니다.

use crate::config::{ConcurrencyConfig, RateLimitConfig};
use crate::ratelimit::TokenBucket;
use crate::registry::{Registry, Target};
use hangar_foundation::event::tool as tool_events;
use hangar_foundation::{CorrelationId, Error, EventBus, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 기본 호출 데드라인
pub const DEFAULT_INVOKE_DEADLINE: Duration = Duration::from_secs(30);

/// 디스패치 요청
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target: String,
    pub tool: String,
    pub arguments: Value,
    pub deadline: Duration,
    pub correlation_id: CorrelationId,
}

impl DispatchRequest {
    pub fn new(target: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            target: target.into(),
            tool: tool.into(),
            arguments,
            deadline: DEFAULT_INVOKE_DEADLINE,
            correlation_id: CorrelationId::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Dispatch Engine
pub struct DispatchEngine {
    registry: Arc<Registry>,
    events: Arc<EventBus>,

    /// 전역 속도 제한 (rps=0이면 비활성)
    limiter: Option<TokenBucket>,

    /// 전역 in-flight 상한 (0이면 무제한)
    global_slots: Option<Arc<Semaphore>>,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<Registry>,
        rate_limit: &RateLimitConfig,
        concurrency: &ConcurrencyConfig,
    ) -> Self {
        let events = Arc::clone(registry.events());
        Self {
            registry,
            events,
            limiter: (rate_limit.rps > 0).then(|| TokenBucket::new(rate_limit.rps)),
            global_slots: (concurrency.global_limit > 0)
                .then(|| Arc::new(Semaphore::new(concurrency.global_limit))),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// 호출 디스패치
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let started = Instant::now();

        let outcome = self.dispatch_inner(&request, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok((provider, _)) => {
                self.events.publish(tool_events::invoked(
                    provider,
                    &request.tool,
                    request.correlation_id.as_str(),
                    duration_ms,
                ));
            }
            Err(e) => {
                self.events.publish(tool_events::failed(
                    &request.target,
                    &request.tool,
                    request.correlation_id.as_str(),
                    e.kind(),
                    duration_ms,
                ));
            }
        }

        outcome.map(|(_, value)| value)
    }

    /// 실제 디스패치 경로. 성공 시 (실제 처리한 provider id, 결과) 반환.
    async fn dispatch_inner(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, Value)> {
        // 1. 대상 해석
        let target = self.registry.resolve(&request.target)?;

        // 2. 전역 속도 제한
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                return Err(Error::RateLimited(format!(
                    "global rate limit on '{}'",
                    request.target
                )));
            }
        }

        // 3. 전역 in-flight 상한 (취소 인지)
        let _slot = match &self.global_slots {
            Some(slots) => {
                let permit = tokio::select! {
                    permit = Arc::clone(slots).acquire_owned() => {
                        permit.map_err(|_| Error::Internal("global slots closed".to_string()))?
                    }
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                };
                Some(permit)
            }
            None => None,
        };

        match target {
            Target::Provider(manager) => {
                let value = manager
                    .invoke(
                        &request.tool,
                        request.arguments.clone(),
                        request.deadline,
                        cancel,
                    )
                    .await?;
                Ok((manager.id().to_string(), value))
            }
            Target::Group(group) => {
                // 브레이커/최소 가용성 판단 후 멤버로 재귀
                let members = self.registry.member_snapshots(&group);
                let member_id = group.pick_member(&members)?;

                let Some(manager) = self.registry.provider(&member_id) else {
                    // 멤버가 리로드로 사라진 경우: 프로브 슬롯만 반납
                    group.record_outcome(false, false);
                    return Err(Error::Internal(format!(
                        "group '{}' member '{}' missing from registry",
                        group.id(),
                        member_id
                    )));
                };

                debug!(
                    "Dispatching '{}' via group '{}' to member '{}'",
                    request.tool,
                    group.id(),
                    member_id
                );

                let result = manager
                    .invoke(
                        &request.tool,
                        request.arguments.clone(),
                        request.deadline,
                        cancel,
                    )
                    .await;

                // 그룹이 결과를 관찰하도록 브레이커에 기록
                match &result {
                    Ok(_) => group.record_outcome(true, true),
                    Err(e) => group.record_outcome(false, e.counts_for_health()),
                }

                result.map(|value| (member_id.to_string(), value))
            }
        }
    }
}
