//! Metrics Collector - 이벤트 버스 구독 기반 메트릭 집계
//!
//! 도메인 이벤트를 구독해서 provider별/배치 메트릭을 메모리에 집계합니다.
//! `/metrics` 엔드포인트와 `registry_metrics` 도구가 스냅샷을 읽습니다.

use async_trait::async_trait;
use hangar_foundation::{EventListener, HangarEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// provider 하나의 집계
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderMetrics {
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub total_duration_ms: u64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub degradation_count: u64,
    pub cold_starts: u64,
    pub stops: u64,

    /// 실패 종류별 카운트 (error kind → count)
    pub failures_by_kind: HashMap<String, u64>,
}

impl ProviderMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 100.0;
        }
        (self.successful_invocations as f64 / self.total_invocations as f64) * 100.0
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.total_invocations == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total_invocations as f64
    }
}

/// 배치 집계
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchMetrics {
    pub batches: u64,
    pub calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub breaker_rejections: u64,
}

/// 서킷 집계
#[derive(Debug, Default, Clone, Serialize)]
pub struct CircuitMetrics {
    pub opened: u64,
    pub reset: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    providers: HashMap<String, ProviderMetrics>,
    batch: BatchMetrics,
    circuit: CircuitMetrics,
}

/// 이벤트 구독형 메트릭 수집기
pub struct MetricsCollector {
    started_at: Instant,
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// 가동 시간 (초)
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// JSON 스냅샷
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock().expect("metrics poisoned");

        let providers: serde_json::Map<String, Value> = state
            .providers
            .iter()
            .map(|(id, m)| {
                let mut entry = serde_json::to_value(m).expect("metrics serializable");
                entry["success_rate"] =
                    Value::from((m.success_rate() * 100.0).round() / 100.0);
                entry["average_latency_ms"] =
                    Value::from((m.average_latency_ms() * 100.0).round() / 100.0);
                (id.clone(), entry)
            })
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "providers": providers,
            "batch": state.batch,
            "circuit": state.circuit,
        })
    }

    fn with_provider<F: FnOnce(&mut ProviderMetrics)>(&self, subject: &Option<String>, apply: F) {
        let Some(id) = subject else { return };
        let mut state = self.state.lock().expect("metrics poisoned");
        apply(state.providers.entry(id.clone()).or_default());
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventListener for MetricsCollector {
    fn name(&self) -> &str {
        "metrics-collector"
    }

    async fn on_event(&self, event: &HangarEvent) {
        let duration_ms = event.data["duration_ms"].as_u64().unwrap_or(0);

        match event.event_type.as_str() {
            "provider.ready" => {
                self.with_provider(&event.subject, |m| m.cold_starts += 1);
            }
            "provider.stopped" => {
                self.with_provider(&event.subject, |m| m.stops += 1);
            }
            "provider.degraded" => {
                self.with_provider(&event.subject, |m| m.degradation_count += 1);
            }
            "health.probe_passed" => {
                self.with_provider(&event.subject, |m| m.health_checks_passed += 1);
            }
            "health.probe_failed" => {
                self.with_provider(&event.subject, |m| m.health_checks_failed += 1);
            }
            "tool.invoked" => {
                self.with_provider(&event.subject, |m| {
                    m.total_invocations += 1;
                    m.successful_invocations += 1;
                    m.total_duration_ms += duration_ms;
                });
            }
            "tool.failed" => {
                let kind = event.data["error_kind"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string();
                self.with_provider(&event.subject, |m| {
                    m.total_invocations += 1;
                    m.failed_invocations += 1;
                    m.total_duration_ms += duration_ms;
                    *m.failures_by_kind.entry(kind).or_default() += 1;
                });
            }
            "circuit.opened" => {
                self.state.lock().expect("metrics poisoned").circuit.opened += 1;
            }
            "circuit.reset" => {
                self.state.lock().expect("metrics poisoned").circuit.reset += 1;
            }
            "batch.completed" => {
                let mut state = self.state.lock().expect("metrics poisoned");
                state.batch.batches += 1;
                state.batch.calls += event.data["total"].as_u64().unwrap_or(0);
                state.batch.succeeded += event.data["succeeded"].as_u64().unwrap_or(0);
                state.batch.failed += event.data["failed"].as_u64().unwrap_or(0);
                state.batch.cancelled += event.data["cancelled"].as_u64().unwrap_or(0);
                state.batch.breaker_rejections +=
                    event.data["breaker_rejections"].as_u64().unwrap_or(0);
            }
            _ => {}
        }
    }
}

// ============================================================================
// 테스트
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_foundation::event::{batch, provider, tool};

    #[tokio::test]
    async fn test_invocation_accounting() {
        let collector = MetricsCollector::new();

        collector
            .on_event(&tool::invoked("math", "add", "c1", 10))
            .await;
        collector
            .on_event(&tool::invoked("math", "add", "c2", 30))
            .await;
        collector
            .on_event(&tool::failed("math", "add", "c3", "timeout", 100))
            .await;

        let snapshot = collector.snapshot();
        let math = &snapshot["providers"]["math"];
        assert_eq!(math["total_invocations"], 3);
        assert_eq!(math["successful_invocations"], 2);
        assert_eq!(math["failures_by_kind"]["timeout"], 1);
    }

    #[tokio::test]
    async fn test_cold_start_counted() {
        let collector = MetricsCollector::new();

        collector
            .on_event(&provider::ready("math", "subprocess", 2, 150))
            .await;
        collector
            .on_event(&provider::ready("math", "subprocess", 2, 90))
            .await;

        let snapshot = collector.snapshot();
        assert_eq!(snapshot["providers"]["math"]["cold_starts"], 2);
    }

    #[tokio::test]
    async fn test_batch_accounting() {
        let collector = MetricsCollector::new();

        collector
            .on_event(&batch::completed("b1", 15, 12, 3, 1, 2, 500))
            .await;

        let snapshot = collector.snapshot();
        assert_eq!(snapshot["batch"]["batches"], 1);
        assert_eq!(snapshot["batch"]["calls"], 15);
        assert_eq!(snapshot["batch"]["breaker_rejections"], 2);
    }
}
