//! 런타임 시나리오 테스트
//!
//! mock 전송으로 코어 전체(매니저 → 그룹 → 디스패치 → 배치)를 구동합니다.

use hangar_core::batch::{BatchCall, BatchExecutor, BatchOptions};
use hangar_core::config::{
    CircuitBreakerSettings, ConcurrencyConfig, GroupMember, GroupSpec, Mode, ProviderEntry,
    ProviderSpec, RateLimitConfig, Strategy,
};
use hangar_core::dispatch::{DispatchEngine, DispatchRequest};
use hangar_core::group::ProviderGroup;
use hangar_core::provider::{ProviderManager, ProviderState};
use hangar_core::registry::Registry;
use hangar_core::retry::RetryConfig;
use hangar_core::testing::{MockTransportFactory, mock_provider_spec};
use hangar_core::transport::TransportFactory;
use hangar_core::worker::IdleGcWorker;
use hangar_foundation::{EventBus, ProviderId};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn spec_with(id: &str, build: impl FnOnce(&mut ProviderEntry)) -> ProviderSpec {
    let mut entry = ProviderEntry {
        mode: Mode::Subprocess,
        command: Some(vec!["mock-server".to_string()]),
        ..Default::default()
    };
    build(&mut entry);
    entry
        .to_provider_spec(ProviderId::new(id).unwrap())
        .unwrap()
}

fn group_spec(
    id: &str,
    strategy: Strategy,
    min_healthy: usize,
    threshold: u32,
    reset_timeout_s: f64,
    members: &[(&str, u32)],
) -> GroupSpec {
    GroupSpec {
        id: ProviderId::new(id).unwrap(),
        description: None,
        strategy,
        min_healthy,
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: threshold,
            reset_timeout_s,
        },
        members: members
            .iter()
            .map(|(id, priority)| GroupMember {
                id: ProviderId::new(*id).unwrap(),
                weight: 1,
                priority: *priority,
            })
            .collect(),
    }
}

/// 빠른 시작 재시도 정책 (테스트가 백오프를 기다리지 않도록)
fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        initial_delay_ms: 1,
        jitter: false,
        ..Default::default()
    }
}

struct Harness {
    registry: Arc<Registry>,
    events: Arc<EventBus>,
}

impl Harness {
    fn new() -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::empty(Arc::clone(&events)));
        Self { registry, events }
    }

    fn add_provider(&self, spec: ProviderSpec) -> (Arc<ProviderManager>, Arc<MockTransportFactory>) {
        let factory = Arc::new(MockTransportFactory::new());
        let manager = Arc::new(
            ProviderManager::new(
                spec,
                Arc::clone(&factory) as Arc<dyn TransportFactory>,
                Arc::clone(&self.events),
            )
                .with_start_retry(fast_retry()),
        );
        self.registry.insert_provider(Arc::clone(&manager));
        (manager, factory)
    }

    fn add_group(&self, spec: GroupSpec) -> Arc<ProviderGroup> {
        let group = Arc::new(ProviderGroup::new(spec, Arc::clone(&self.events)));
        self.registry.insert_group(Arc::clone(&group));
        group
    }

    fn engine(&self, rps: u32) -> Arc<DispatchEngine> {
        Arc::new(DispatchEngine::new(
            Arc::clone(&self.registry),
            &RateLimitConfig { rps },
            &ConcurrencyConfig::default(),
        ))
    }
}

// ============================================================================
// 시나리오 1: cold start single-flight
// ============================================================================

#[tokio::test]
async fn cold_start_single_flight() {
    let harness = Harness::new();
    let (manager, factory) = harness.add_provider(mock_provider_spec("math"));
    factory.behavior.set_start_delay(Duration::from_millis(50));
    let engine = harness.engine(0);

    assert_eq!(manager.state(), ProviderState::Cold);

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let request = DispatchRequest::new("math", "add", json!({"a": i, "b": i}));
            engine.dispatch(request, &cancel).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.await.unwrap().expect("call should succeed");
        let expected = (2 * i) as f64;
        assert_eq!(value["structuredContent"]["result"], json!(expected));
    }

    // 프로세스는 정확히 한 번만 시작
    assert_eq!(factory.behavior.launches(), 1);
    assert_eq!(manager.state(), ProviderState::Ready);
    assert_eq!(manager.start_count(), 1);
}

// ============================================================================
// 시나리오 2: breaker trip
// ============================================================================

#[tokio::test]
async fn breaker_trips_and_resets() {
    let harness = Harness::new();
    let (_manager, factory) = harness.add_provider(mock_provider_spec("flaky"));
    harness.add_group(group_spec(
        "g",
        Strategy::RoundRobin,
        0,
        3,
        0.3,
        &[("flaky", 0)],
    ));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    // 멤버가 뜨지 못하게 함
    factory.behavior.fail_next_connects(100);

    for call in 1..=3 {
        let err = engine
            .dispatch(DispatchRequest::new("g", "add", json!({"a": 1, "b": 2})), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transport_error", "call #{call}");
    }

    // 4번째: 브레이커가 열려 즉시 거부 (<100ms)
    let started = Instant::now();
    let err = engine
        .dispatch(DispatchRequest::new("g", "add", json!({"a": 1, "b": 2})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "circuit_open");
    assert!(started.elapsed() < Duration::from_millis(100));

    // 멤버 복구 + reset timeout 경과 후: half-open 프로브가 성공하고 닫힘
    factory.behavior.fail_next_connects(0);
    tokio::time::sleep(Duration::from_millis(350)).await;

    let value = engine
        .dispatch(DispatchRequest::new("g", "add", json!({"a": 2, "b": 3})), &cancel)
        .await
        .expect("probe call should succeed");
    assert_eq!(value["structuredContent"]["result"], json!(5.0));

    let group = harness
        .registry
        .group(&ProviderId::new("g").unwrap())
        .unwrap();
    assert_eq!(group.breaker().mode(), hangar_core::CircuitMode::Closed);
}

// ============================================================================
// 시나리오 3: priority failover
// ============================================================================

#[tokio::test]
async fn priority_failover_and_recovery() {
    let harness = Harness::new();
    let (p1, p1_factory) = harness.add_provider(mock_provider_spec("p1"));
    let (p2, _p2_factory) = harness.add_provider(mock_provider_spec("p2"));
    harness.add_group(group_spec(
        "g",
        Strategy::Priority,
        0,
        10,
        30.0,
        &[("p1", 1), ("p2", 2)],
    ));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    // 정상 상태: 우선순위가 낮은 숫자인 p1으로
    engine
        .dispatch(DispatchRequest::new("g", "add", json!({"a": 1, "b": 1})), &cancel)
        .await
        .unwrap();
    assert_eq!(p1.state(), ProviderState::Ready);
    assert_eq!(p2.state(), ProviderState::Cold);

    // p1 프로세스를 죽이고 헬스 체크가 감지
    p1_factory.kill_latest();
    assert!(!p1.health_check().await);
    assert_eq!(p1.state(), ProviderState::Dead);

    // 다음 호출은 p2로 페일오버
    engine
        .dispatch(DispatchRequest::new("g", "add", json!({"a": 2, "b": 2})), &cancel)
        .await
        .expect("failover call should succeed");
    assert_eq!(p2.state(), ProviderState::Ready);

    // p1 재시작 + 프로브 성공 후: 다시 p1으로 복귀
    p1.ensure_ready().await.expect("restart p1");
    assert!(p1.health_check().await);
    assert_eq!(p1.state(), ProviderState::Ready);

    let p2_invocations_before = p2.health().snapshot().total_invocations;
    engine
        .dispatch(DispatchRequest::new("g", "add", json!({"a": 3, "b": 3})), &cancel)
        .await
        .unwrap();
    // p1이 다시 로테이션 선두이므로 p2는 호출을 받지 않음
    assert_eq!(
        p2.health().snapshot().total_invocations,
        p2_invocations_before
    );
    assert_eq!(p1_factory.behavior.launches(), 2);
}

// ============================================================================
// 시나리오 4: batch fan-out
// ============================================================================

#[tokio::test]
async fn batch_fan_out_preserves_order_and_single_flight() {
    let harness = Harness::new();
    let (_a, a_factory) = harness.add_provider(mock_provider_spec("a"));
    let (b, b_factory) = harness.add_provider(mock_provider_spec("b"));
    let (_c, c_factory) = harness.add_provider(mock_provider_spec("c"));
    let engine = harness.engine(0);

    // b는 미리 따뜻하게
    b.ensure_ready().await.unwrap();

    // a는 cold + 느린 시작, c는 첫 호출이 한 번 실패
    a_factory.behavior.set_start_delay(Duration::from_millis(40));
    a_factory.behavior.set_call_delay(Duration::from_millis(30));
    b_factory.behavior.set_call_delay(Duration::from_millis(30));
    c_factory.behavior.fail_next_calls(1);

    let executor = BatchExecutor::new(Arc::clone(&engine), Arc::clone(&harness.events));

    let mut calls = Vec::new();
    for i in 0..15 {
        let provider = match i % 3 {
            0 => "a",
            1 => "b",
            _ => "c",
        };
        calls.push(BatchCall {
            provider: provider.to_string(),
            tool: "add".to_string(),
            arguments: json!({"a": i, "b": 0}),
            timeout: None,
        });
    }

    let started = Instant::now();
    let result = executor
        .execute(
            calls,
            BatchOptions {
                max_parallel: Some(8),
                timeout: Some(10.0),
                fail_fast: false,
            },
        )
        .await;
    let wall = started.elapsed();

    // 결과는 입력 순서 보존
    assert_eq!(result.total, 15);
    for (i, call_result) in result.results.iter().enumerate() {
        assert_eq!(call_result.index, i);
    }

    // c의 첫 호출 하나만 transport_error, 나머지 성공
    assert_eq!(result.failed, 1);
    let failed: Vec<_> = result.results.iter().filter(|r| !r.ok).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_kind.as_deref(), Some("transport_error"));

    // a는 5건이 몰렸지만 시작은 한 번
    assert_eq!(a_factory.behavior.launches(), 1);

    // 병렬 실행: 순차 합(15 * 30ms + 시작 40ms)보다 훨씬 짧아야 함
    assert!(wall < Duration::from_millis(450), "wall time {:?}", wall);

    // 실패한 호출만 재시도하면 성공
    let retry = executor
        .execute(
            vec![BatchCall {
                provider: "c".to_string(),
                tool: "add".to_string(),
                arguments: json!({"a": 2, "b": 0}),
                timeout: None,
            }],
            BatchOptions::default(),
        )
        .await;
    assert!(retry.success);
}

#[tokio::test]
async fn batch_fail_fast_cancels_siblings() {
    let harness = Harness::new();
    let (_p, factory) = harness.add_provider(mock_provider_spec("p"));
    let engine = harness.engine(0);

    factory.behavior.set_call_delay(Duration::from_millis(80));
    factory.behavior.fail_next_calls(1);

    let executor = BatchExecutor::new(Arc::clone(&engine), Arc::clone(&harness.events));
    let calls = (0..6)
        .map(|i| BatchCall {
            provider: "p".to_string(),
            tool: "add".to_string(),
            arguments: json!({"a": i, "b": 0}),
            timeout: None,
        })
        .collect();

    let result = executor
        .execute(
            calls,
            BatchOptions {
                max_parallel: Some(2),
                timeout: Some(10.0),
                fail_fast: true,
            },
        )
        .await;

    assert!(!result.success);
    // 첫 실패 이후 남은 호출들은 취소됨
    assert!(result.cancelled > 0, "expected cancellations: {:?}", result);
}

#[tokio::test]
async fn batch_deadline_records_timeouts() {
    let harness = Harness::new();
    let (_p, factory) = harness.add_provider(mock_provider_spec("p"));
    let engine = harness.engine(0);

    factory.behavior.set_call_delay(Duration::from_millis(500));

    let executor = BatchExecutor::new(Arc::clone(&engine), Arc::clone(&harness.events));
    let calls = (0..3)
        .map(|i| BatchCall {
            provider: "p".to_string(),
            tool: "add".to_string(),
            arguments: json!({"a": i, "b": 0}),
            timeout: None,
        })
        .collect();

    let result = executor
        .execute(
            calls,
            BatchOptions {
                max_parallel: Some(3),
                timeout: Some(0.15),
                fail_fast: false,
            },
        )
        .await;

    assert_eq!(result.succeeded, 0);
    for call_result in &result.results {
        assert_eq!(call_result.error_kind.as_deref(), Some("timeout"));
    }
}

// ============================================================================
// 시나리오 5: idle GC
// ============================================================================

#[tokio::test]
async fn idle_gc_reclaims_and_next_invoke_relaunches() {
    let harness = Harness::new();
    let (manager, factory) = harness.add_provider(spec_with("math", |e| {
        e.idle_ttl_s = 1;
    }));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    engine
        .dispatch(DispatchRequest::new("math", "add", json!({"a": 1, "b": 2})), &cancel)
        .await
        .unwrap();
    assert_eq!(manager.state(), ProviderState::Ready);
    assert_eq!(factory.behavior.launches(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    IdleGcWorker::gc_pass(&harness.registry).await;
    assert_eq!(manager.state(), ProviderState::Cold);

    // 다음 호출은 재시작
    engine
        .dispatch(DispatchRequest::new("math", "add", json!({"a": 3, "b": 4})), &cancel)
        .await
        .unwrap();
    assert_eq!(manager.state(), ProviderState::Ready);
    assert_eq!(factory.behavior.launches(), 2);
}

#[tokio::test]
async fn idle_gc_respects_group_min_healthy() {
    let harness = Harness::new();
    let (manager, _factory) = harness.add_provider(spec_with("solo", |e| {
        e.idle_ttl_s = 1;
    }));
    harness.add_group(group_spec(
        "g",
        Strategy::RoundRobin,
        1,
        5,
        30.0,
        &[("solo", 0)],
    ));

    manager.ensure_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // 회수하면 그룹의 세션 보유 멤버가 min_healthy 아래로 떨어지므로 보호
    IdleGcWorker::gc_pass(&harness.registry).await;
    assert_eq!(manager.state(), ProviderState::Ready);
}

// ============================================================================
// 시나리오 6: rate limit
// ============================================================================

#[tokio::test]
async fn rate_limit_rejects_excess_calls() {
    let harness = Harness::new();
    let (manager, _factory) = harness.add_provider(mock_provider_spec("math"));
    manager.ensure_ready().await.unwrap();

    let engine = harness.engine(2);
    let cancel = CancellationToken::new();

    let mut ok = 0;
    let mut limited = 0;
    for i in 0..20 {
        let request = DispatchRequest::new("math", "add", json!({"a": i, "b": i}));
        match engine.dispatch(request, &cancel).await {
            Ok(_) => ok += 1,
            Err(e) => {
                assert_eq!(e.kind(), "rate_limited");
                limited += 1;
            }
        }
    }

    // 버스트 용량(=rps)만큼만 즉시 통과
    assert!(ok >= 2 && ok <= 4, "ok={ok}");
    assert_eq!(ok + limited, 20);
}

// ============================================================================
// 경계 동작
// ============================================================================

#[tokio::test]
async fn zero_deadline_times_out_without_backend_call() {
    let harness = Harness::new();
    let (_manager, factory) = harness.add_provider(mock_provider_spec("math"));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    let request = DispatchRequest::new("math", "add", json!({"a": 1, "b": 2}))
        .with_deadline(Duration::ZERO);
    let err = engine.dispatch(request, &cancel).await.unwrap_err();

    assert_eq!(err.kind(), "timeout");
    assert_eq!(factory.behavior.launches(), 0);
}

#[tokio::test]
async fn unknown_tool_rejected_from_catalog() {
    let harness = Harness::new();
    let (_manager, _factory) = harness.add_provider(mock_provider_spec("math"));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    let err = engine
        .dispatch(DispatchRequest::new("math", "no_such_tool", json!({})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_tool");
}

#[tokio::test]
async fn unknown_target_rejected() {
    let harness = Harness::new();
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    let err = engine
        .dispatch(DispatchRequest::new("ghost", "add", json!({})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_target");
}

#[tokio::test]
async fn shutdown_is_idempotent_and_restartable() {
    let harness = Harness::new();
    let (manager, factory) = harness.add_provider(mock_provider_spec("math"));

    manager.ensure_ready().await.unwrap();
    assert_eq!(factory.behavior.launches(), 1);

    manager.shutdown("test").await;
    manager.shutdown("test").await;
    manager.shutdown("test").await;
    assert_eq!(manager.state(), ProviderState::Cold);

    manager.ensure_ready().await.unwrap();
    assert_eq!(manager.state(), ProviderState::Ready);
    assert_eq!(factory.behavior.launches(), 2);
}

#[tokio::test]
async fn degraded_after_consecutive_call_failures() {
    let harness = Harness::new();
    let (manager, factory) = harness.add_provider(mock_provider_spec("flaky"));
    let engine = harness.engine(0);
    let cancel = CancellationToken::new();

    manager.ensure_ready().await.unwrap();
    factory.behavior.fail_next_calls(3);

    for _ in 0..3 {
        let _ = engine
            .dispatch(DispatchRequest::new("flaky", "add", json!({"a": 1, "b": 1})), &cancel)
            .await;
    }

    // max_consecutive_failures 기본값 3 도달 → degraded
    assert_eq!(manager.state(), ProviderState::Degraded);

    // 성공하는 호출이 오면 복구
    engine
        .dispatch(DispatchRequest::new("flaky", "add", json!({"a": 1, "b": 1})), &cancel)
        .await
        .unwrap();
    assert_eq!(manager.state(), ProviderState::Ready);
}
