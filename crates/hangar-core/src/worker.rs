//! 백그라운드 워커 - 주기적 헬스 프로브와 Idle GC
//!
//! 두 워커 모두 취소 토큰으로 종료합니다. 프로브는 세션이 있는
//! (ready/degraded) provider만 대상으로 합니다.

use crate::provider::ProviderManager;
use crate::registry::Registry;
use hangar_foundation::ProviderId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Idle GC 스캔 주기
pub const GC_SCAN_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Health Worker
// ============================================================================

/// 주기적 헬스 프로브 워커
pub struct HealthWorker;

impl HealthWorker {
    /// 워커 시작
    pub fn spawn(
        registry: Arc<Registry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Health worker started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 첫 tick은 즉시 발화하므로 버린다
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::probe_all(&registry).await;
                    }
                }
            }
            info!("Health worker stopped");
        })
    }

    async fn probe_all(registry: &Registry) {
        for manager in registry.providers() {
            if !manager.state().has_session() {
                continue;
            }
            let healthy = manager.health_check().await;
            debug!(
                "health_probe: provider={}, healthy={}",
                manager.id(),
                healthy
            );
        }
    }
}

// ============================================================================
// Idle GC Worker
// ============================================================================

/// 유휴 provider 회수 워커
pub struct IdleGcWorker;

impl IdleGcWorker {
    /// 워커 시작
    pub fn spawn(registry: Arc<Registry>, cancel: CancellationToken) -> JoinHandle<()> {
        Self::spawn_with_interval(registry, GC_SCAN_INTERVAL, cancel)
    }

    pub fn spawn_with_interval(
        registry: Arc<Registry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Idle GC worker started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::gc_pass(&registry).await;
                    }
                }
            }
            info!("Idle GC worker stopped");
        })
    }

    /// GC 한 바퀴: TTL 초과 + in-flight 없음 + 그룹 가용성 보호
    pub async fn gc_pass(registry: &Registry) {
        for manager in registry.providers() {
            if !manager.state().has_session() || manager.in_flight() > 0 {
                continue;
            }
            if manager.idle_time() < manager.spec().idle_ttl {
                continue;
            }
            if Self::gc_protected(registry, manager.id(), &manager) {
                debug!(
                    "gc_skip: provider={} protected by group min_healthy",
                    manager.id()
                );
                continue;
            }
            manager.maybe_shutdown_idle().await;
        }
    }

    /// 회수 시 어떤 그룹이든 세션 보유 멤버 수가 min_healthy 아래로
    /// 떨어지면 보호 대상
    fn gc_protected(
        registry: &Registry,
        provider_id: &ProviderId,
        manager: &Arc<ProviderManager>,
    ) -> bool {
        if !manager.state().has_session() {
            return false;
        }

        for group in registry.groups_containing(provider_id) {
            let with_session = registry
                .member_snapshots(&group)
                .iter()
                .filter(|m| m.state.has_session())
                .count();

            // 이 provider를 회수하면 with_session - 1
            if with_session <= group.spec().min_healthy {
                return true;
            }
        }
        false
    }
}
