//! Provider Manager - provider별 수명주기 관리
//!
//! 상태 머신, single-flight 콜드 스타트, 호출 동시성 제한, health 집계를
//! 한 곳에서 소유합니다. 전송과 세션은 이 매니저만 생성/폐기합니다.

use super::health::{HealthSnapshot, HealthTracker};
use super::state::ProviderState;
use crate::config::ProviderSpec;
use crate::retry::{with_retry, RetryConfig};
use crate::session::{ProviderSession, ToolDescriptor};
use crate::single_flight::SingleFlight;
use crate::transport::TransportFactory;
use hangar_foundation::event::{health as health_events, provider as provider_events};
use hangar_foundation::{Error, EventBus, ProviderId, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 헬스 프로브 데드라인
pub const HEALTH_PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// shutdown 시 in-flight 호출 드레인 유예 기간
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// 상태 조회 스냅샷 (registry_list / registry_details용)
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub state: ProviderState,
    pub mode: &'static str,
    pub alive: bool,
    pub description: Option<String>,
    pub tools_count: usize,
    pub tools_cached: Vec<String>,
    pub health: HealthSnapshot,
    pub idle_time_s: f64,
    pub in_flight: usize,
    pub start_count: u64,
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager").finish_non_exhaustive()
    }
}

/// Provider Manager
pub struct ProviderManager {
    spec: ProviderSpec,

    /// 현재 상태 (단일 작성자: 이 매니저)
    state: StdRwLock<ProviderState>,

    /// 활성 세션 (ready/degraded 동안에만 Some)
    session: RwLock<Option<Arc<ProviderSession>>>,

    /// Health 집계
    health: HealthTracker,

    /// Single-flight 시작 게이트
    start_flight: SingleFlight,

    /// 시작 재시도 정책
    start_retry: RetryConfig,

    /// provider별 동시 호출 제한
    semaphore: Arc<Semaphore>,

    /// in-flight 호출 수 (least_connections / idle GC용)
    in_flight: Arc<AtomicUsize>,

    /// 마지막 사용 시각
    last_used: StdMutex<Instant>,

    /// 콜드 스타트 횟수
    start_count: AtomicU64,

    /// 전송 생성 팩토리 (테스트에서 교체)
    factory: Arc<dyn TransportFactory>,

    /// 이벤트 버스
    events: Arc<EventBus>,
}

impl ProviderManager {
    pub fn new(
        spec: ProviderSpec,
        factory: Arc<dyn TransportFactory>,
        events: Arc<EventBus>,
    ) -> Self {
        let max_in_flight = spec.max_in_flight;
        Self {
            spec,
            state: StdRwLock::new(ProviderState::Cold),
            session: RwLock::new(None),
            health: HealthTracker::new(3),
            start_flight: SingleFlight::new(),
            start_retry: RetryConfig::default(),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_used: StdMutex::new(Instant::now()),
            start_count: AtomicU64::new(0),
            factory,
            events,
        }
        .with_spec_health()
    }

    fn with_spec_health(mut self) -> Self {
        self.health = HealthTracker::new(self.spec.max_consecutive_failures);
        self
    }

    /// 시작 재시도 정책 교체 (테스트용)
    pub fn with_start_retry(mut self, retry: RetryConfig) -> Self {
        self.start_retry = retry;
        self
    }

    pub fn id(&self) -> &ProviderId {
        &self.spec.id
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// 현재 상태
    pub fn state(&self) -> ProviderState {
        *self.state.read().expect("state lock poisoned")
    }

    /// 현재 in-flight 호출 수
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 콜드 스타트 횟수
    pub fn start_count(&self) -> u64 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// 마지막 사용 후 경과 시간
    pub fn idle_time(&self) -> Duration {
        self.last_used.lock().expect("last_used poisoned").elapsed()
    }

    // ========================================================================
    // 상태 전이
    // ========================================================================

    fn transition(&self, next: ProviderState) {
        let mut state = self.state.write().expect("state lock poisoned");
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            // 원복 불가능한 경합(예: 드레인 중 shutdown)은 강제 전이로 처리
            debug!(
                "Forcing state transition {} -> {} for '{}'",
                state, next, self.spec.id
            );
        }
        debug!("Provider '{}': {} -> {}", self.spec.id, *state, next);
        *state = next;
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used poisoned") = Instant::now();
    }

    // ========================================================================
    // Ensure Ready (single-flight cold start)
    // ========================================================================

    /// provider를 ready 상태로 보장
    ///
    /// cold/dead 상태면 시작합니다. 동시에 N명이 호출해도 전송 시작은
    /// 정확히 한 번 일어나고 모두 같은 결과를 관찰합니다.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.session_alive().await {
            return Ok(());
        }

        self.start_flight.run(|| self.start_once()).await
    }

    /// 살아있는 세션이 있는지 (ready 또는 degraded)
    async fn session_alive(&self) -> bool {
        if !self.state().has_session() {
            return false;
        }
        match self.session.read().await.as_ref() {
            Some(session) if session.is_alive() => true,
            Some(_) => {
                warn!("Provider '{}' session died underneath", self.spec.id);
                false
            }
            None => false,
        }
    }

    /// 실제 시작 (single-flight 리더만 실행)
    async fn start_once(&self) -> Result<()> {
        // 직전 flight가 이미 띄웠으면 재사용
        if self.session_alive().await {
            return Ok(());
        }

        // 죽은 세션 정리
        if let Some(old) = self.session.write().await.take() {
            let _ = old.close().await;
        }

        let started = Instant::now();
        self.transition(ProviderState::Initializing);
        self.events
            .publish(provider_events::starting(self.spec.id.as_str(), self.spec.mode.as_str()));

        let cancel = CancellationToken::new();
        let outcome = with_retry(&self.start_retry, self.spec.id.as_str(), &cancel, || {
            self.connect_and_handshake()
        })
        .await;

        match outcome {
            Ok(tools_count) => {
                self.transition(ProviderState::Ready);
                self.health.record_success();
                self.touch();
                self.start_count.fetch_add(1, Ordering::SeqCst);

                let startup_ms = started.elapsed().as_millis() as u64;
                info!(
                    "provider_started: {}, mode={}, tools={}, cold_start={}ms",
                    self.spec.id,
                    self.spec.mode.as_str(),
                    tools_count,
                    startup_ms
                );
                self.events.publish(provider_events::ready(
                    self.spec.id.as_str(),
                    self.spec.mode.as_str(),
                    tools_count,
                    startup_ms,
                ));
                Ok(())
            }
            Err(e) => {
                self.health.record_failure(&e.to_string());
                self.transition(ProviderState::Dead);
                error!("provider_start_failed: {}, error={}", self.spec.id, e);
                Err(e)
            }
        }
    }

    /// 전송 생성 + MCP 핸드셰이크
    async fn connect_and_handshake(&self) -> Result<usize> {
        let handle = self.factory.connect(&self.spec).await?;
        let cancel = CancellationToken::new();

        match ProviderSession::establish(
            self.spec.id.clone(),
            Arc::clone(&handle.transport),
            handle.notifications,
            &cancel,
        )
        .await
        {
            Ok(session) => {
                let tools_count = session.tools_count();
                *self.session.write().await = Some(session);
                Ok(tools_count)
            }
            Err(e) => {
                // 부분적으로 시작된 전송 정리
                let tail = handle.transport.stderr_tail();
                if !tail.is_empty() {
                    debug!(
                        "provider '{}' stderr tail: {}",
                        self.spec.id,
                        tail.join(" | ")
                    );
                }
                let _ = handle.transport.close().await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Invoke
    // ========================================================================

    /// 도구 호출
    ///
    /// ensure_ready → 세마포어 → 세션 호출 → health 집계 → last_used 갱신.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if deadline.is_zero() {
            // 백엔드 호출 없이 즉시 타임아웃
            return Err(Error::Timeout(format!(
                "deadline expired before dispatch to '{}'",
                self.spec.id
            )));
        }

        self.ensure_ready().await?;

        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Transport(format!("no session for '{}'", self.spec.id)))?;

        // provider별 동시성 제한 (취소 인지)
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Internal("semaphore closed".to_string()))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let _guard = InFlightGuard::new(permit, Arc::clone(&self.in_flight));

        let effective = deadline.min(self.spec.read_timeout());
        let result = session.invoke(tool, arguments, effective, cancel).await;

        match &result {
            Ok(_) => {
                self.health.record_success();
                if self.state() == ProviderState::Degraded {
                    self.transition(ProviderState::Ready);
                    self.events
                        .publish(provider_events::recovered(self.spec.id.as_str()));
                }
            }
            Err(e) if e.counts_for_health() => {
                let crossed = self.health.record_failure(&e.to_string());
                if crossed && self.state() == ProviderState::Ready {
                    self.transition(ProviderState::Degraded);
                    self.events.publish(provider_events::degraded(
                        self.spec.id.as_str(),
                        self.health.consecutive_failures(),
                        &e.to_string(),
                    ));
                }
            }
            Err(_) => {
                // 도구 결과/호출자 실수는 health에 반영하지 않음
            }
        }

        self.touch();
        result
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// 능동 헬스 프로브 (Health Worker와 registry_health에서 호출)
    pub async fn health_check(&self) -> bool {
        if !self.state().has_session() {
            return false;
        }

        let Some(session) = self.session.read().await.clone() else {
            return false;
        };

        if !session.is_alive() {
            warn!("provider_dead: {}", self.spec.id);
            self.transition(ProviderState::Dead);
            self.events
                .publish(provider_events::stopped(self.spec.id.as_str(), "transport_dead"));
            return false;
        }

        let probe_started = Instant::now();
        let cancel = CancellationToken::new();
        match session.probe(HEALTH_PROBE_DEADLINE, &cancel).await {
            Ok(_) => {
                self.health.record_success();
                self.events.publish(health_events::probe_passed(
                    self.spec.id.as_str(),
                    probe_started.elapsed().as_millis() as u64,
                ));
                if self.state() == ProviderState::Degraded {
                    self.transition(ProviderState::Ready);
                    self.events
                        .publish(provider_events::recovered(self.spec.id.as_str()));
                }
                true
            }
            Err(e) => {
                let crossed = self.health.record_failure(&e.to_string());
                self.events.publish(health_events::probe_failed(
                    self.spec.id.as_str(),
                    self.health.consecutive_failures(),
                    &e.to_string(),
                ));
                warn!("health_check_failed: {}, error={}", self.spec.id, e);

                if crossed && self.state() == ProviderState::Ready {
                    self.transition(ProviderState::Degraded);
                    self.events.publish(provider_events::degraded(
                        self.spec.id.as_str(),
                        self.health.consecutive_failures(),
                        "health_check_failures",
                    ));
                }
                false
            }
        }
    }

    // ========================================================================
    // Shutdown / Idle GC
    // ========================================================================

    /// 명시적 종료. 멱등.
    pub async fn shutdown(&self, reason: &str) {
        if self.state() == ProviderState::Cold {
            return;
        }

        // in-flight 호출 드레인 (유예 기간 내)
        let drain_started = Instant::now();
        while self.in_flight() > 0 && drain_started.elapsed() < SHUTDOWN_DRAIN_GRACE {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if let Some(session) = self.session.write().await.take() {
            if let Err(e) = session.close().await {
                warn!("shutdown_error: {}, error={}", self.spec.id, e);
            }
        }

        self.transition(ProviderState::Cold);
        info!("provider_stopped: {}, reason={}", self.spec.id, reason);
        self.events
            .publish(provider_events::stopped(self.spec.id.as_str(), reason));
    }

    /// idle TTL 초과 시 종료. 종료했으면 true.
    pub async fn maybe_shutdown_idle(&self) -> bool {
        if !self.state().has_session() {
            return false;
        }
        if self.in_flight() > 0 {
            return false;
        }
        let idle = self.idle_time();
        if idle < self.spec.idle_ttl {
            return false;
        }

        info!(
            "provider_idle_shutdown: {}, idle={:.1}s",
            self.spec.id,
            idle.as_secs_f64()
        );
        self.shutdown("idle").await;
        true
    }

    // ========================================================================
    // 조회
    // ========================================================================

    /// 도구 목록
    ///
    /// 살아있는 세션의 발견 결과가 우선이고, cold 상태에서는 설정에 선언된
    /// 도구를 fallback으로 반환합니다.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        if let Some(session) = self.session.read().await.as_ref() {
            return session.tools();
        }
        self.spec
            .declared_tools
            .iter()
            .map(ToolDescriptor::from)
            .collect()
    }

    /// 상태 스냅샷
    pub async fn status(&self) -> ProviderStatus {
        let session = self.session.read().await.clone();
        let (alive, tools_cached) = match &session {
            Some(s) => (s.is_alive(), s.tools().iter().map(|t| t.name.clone()).collect()),
            None => (
                false,
                self.spec
                    .declared_tools
                    .iter()
                    .map(|t| t.name.clone())
                    .collect(),
            ),
        };

        let tools_count = match &session {
            Some(s) => s.tools_count(),
            None => self.spec.declared_tools.len(),
        };

        ProviderStatus {
            provider: self.spec.id.to_string(),
            state: self.state(),
            mode: self.spec.mode.as_str(),
            alive,
            description: self.spec.description.clone(),
            tools_count,
            tools_cached,
            health: self.health.snapshot(),
            idle_time_s: self.idle_time().as_secs_f64(),
            in_flight: self.in_flight(),
            start_count: self.start_count(),
        }
    }

    /// 진단용 stderr 꼬리
    pub async fn stderr_tail(&self) -> Vec<String> {
        match self.session.read().await.as_ref() {
            Some(session) => session.stderr_tail(),
            None => Vec::new(),
        }
    }
}

/// in-flight 카운터 가드 (세마포어 permit과 함께 드랍)
struct InFlightGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn new(permit: tokio::sync::OwnedSemaphorePermit, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            _permit: permit,
            counter,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
