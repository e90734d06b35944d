//! Batch Executor - N건 병렬 fan-out
//!
//! 결과는 입력 순서를 보존합니다. 배치 데드라인이 끝나면 남은 호출은
//! 협조적으로 취소되고 timeout으로 기록됩니다. 같은 cold provider로 향하는
//! 호출들은 Provider Manager의 single-flight 덕에 시작을 한 번만 유발합니다.

use crate::dispatch::{DispatchEngine, DispatchRequest};
use hangar_foundation::event::batch as batch_events;
use hangar_foundation::{CorrelationId, Error, EventBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 기본 배치 데드라인
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// 기본 최대 병렬도
const DEFAULT_MAX_PARALLEL: usize = 8;

/// 배치 내 호출 한 건
#[derive(Debug, Clone, Deserialize)]
pub struct BatchCall {
    pub provider: String,
    pub tool: String,

    #[serde(default)]
    pub arguments: Value,

    /// 호출별 데드라인 (초). 배치 데드라인보다 클 수 없음.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// 배치 옵션
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchOptions {
    /// 동시 실행 상한 (기본: min(호출 수, 설정 상한))
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// 배치 전체 데드라인 (초, 기본 60)
    #[serde(default)]
    pub timeout: Option<f64>,

    /// 첫 실패 시 남은 호출 취소
    #[serde(default)]
    pub fail_fast: bool,
}

/// 호출 한 건의 결과
#[derive(Debug, Clone, Serialize)]
pub struct BatchCallResult {
    pub index: usize,
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub elapsed_ms: f64,
}

/// 배치 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub success: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed_ms: f64,
    pub results: Vec<BatchCallResult>,
}

/// Batch Executor
pub struct BatchExecutor {
    dispatch: Arc<DispatchEngine>,
    events: Arc<EventBus>,
    default_max_parallel: usize,
}

impl BatchExecutor {
    pub fn new(dispatch: Arc<DispatchEngine>, events: Arc<EventBus>) -> Self {
        Self {
            dispatch,
            events,
            default_max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// 병렬도 기본값 교체
    pub fn with_default_max_parallel(mut self, max_parallel: usize) -> Self {
        self.default_max_parallel = max_parallel.max(1);
        self
    }

    /// 배치 실행
    pub async fn execute(&self, calls: Vec<BatchCall>, options: BatchOptions) -> BatchResult {
        let batch_id = CorrelationId::new().to_string();
        let total = calls.len();
        let started = Instant::now();

        if calls.is_empty() {
            return BatchResult {
                batch_id,
                success: true,
                total: 0,
                succeeded: 0,
                failed: 0,
                cancelled: 0,
                elapsed_ms: 0.0,
                results: Vec::new(),
            };
        }

        let max_parallel = options
            .max_parallel
            .unwrap_or_else(|| total.min(self.default_max_parallel))
            .max(1);
        let batch_deadline = options
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_BATCH_TIMEOUT);
        let fail_fast = options.fail_fast;

        debug!(
            "batch_dispatch_start: id={}, calls={}, max_parallel={}, timeout={:?}, fail_fast={}",
            batch_id, total, max_parallel, batch_deadline, fail_fast
        );

        let cancel = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        // 배치 데드라인 워치독
        let watchdog = {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            let batch_id = batch_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(batch_deadline).await;
                warn!("batch_global_timeout: id={}", batch_id);
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let semaphore = Arc::new(Semaphore::new(max_parallel));

        let mut handles = Vec::with_capacity(total);
        for (index, call) in calls.into_iter().enumerate() {
            let dispatch = Arc::clone(&self.dispatch);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let call_started = Instant::now();

                let outcome = Self::execute_call(
                    dispatch,
                    semaphore,
                    &call,
                    started,
                    batch_deadline,
                    &cancel,
                )
                .await;

                if fail_fast && outcome.is_err() && !cancel.is_cancelled() {
                    debug!("batch_fail_fast_triggered: index={}", index);
                    cancel.cancel();
                }

                (index, outcome, call_started.elapsed())
            }));
        }

        // 입력 순서대로 결과 수집
        let mut results = Vec::with_capacity(total);
        for handle in handles {
            let (index, outcome, elapsed) = match handle.await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("batch task panicked: {}", e);
                    (
                        results.len(),
                        Err(Error::Internal("batch task panicked".to_string())),
                        Duration::ZERO,
                    )
                }
            };

            results.push(Self::to_call_result(index, outcome, elapsed, &timed_out));
        }
        watchdog.abort();

        let succeeded = results.iter().filter(|r| r.ok).count();
        let deadline_hit = timed_out.load(Ordering::SeqCst);
        let cancelled = results
            .iter()
            .filter(|r| match r.error_kind.as_deref() {
                Some("cancelled") => true,
                Some("timeout") => deadline_hit,
                _ => false,
            })
            .count();
        let failed = total - succeeded;
        let breaker_rejections = results
            .iter()
            .filter(|r| r.error_kind.as_deref() == Some("circuit_open"))
            .count();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            "batch_completed: id={}, total={}, succeeded={}, failed={}, cancelled={}, elapsed_ms={:.1}",
            batch_id, total, succeeded, failed, cancelled, elapsed_ms
        );

        self.events.publish(batch_events::completed(
            &batch_id,
            total,
            succeeded,
            failed,
            cancelled,
            breaker_rejections,
            elapsed_ms as u64,
        ));

        BatchResult {
            batch_id,
            success: failed == 0,
            total,
            succeeded,
            failed,
            cancelled,
            elapsed_ms,
            results,
        }
    }

    /// 호출 한 건 실행 (병렬도 슬롯 + 남은 데드라인 계산)
    async fn execute_call(
        dispatch: Arc<DispatchEngine>,
        semaphore: Arc<Semaphore>,
        call: &BatchCall,
        batch_started: Instant,
        batch_deadline: Duration,
        cancel: &CancellationToken,
    ) -> hangar_foundation::Result<Value> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // 병렬도 슬롯 획득 (취소 인지)
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| Error::Internal("batch semaphore closed".to_string()))?
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        // 유효 데드라인 = min(호출별, 배치 잔여)
        let remaining = batch_deadline.saturating_sub(batch_started.elapsed());
        if remaining.is_zero() {
            return Err(Error::Timeout("batch deadline exhausted".to_string()));
        }
        let deadline = match call.timeout {
            Some(secs) => remaining.min(Duration::from_secs_f64(secs)),
            None => remaining,
        };

        let request = DispatchRequest::new(&call.provider, &call.tool, call.arguments.clone())
            .with_deadline(deadline);

        dispatch.dispatch(request, cancel).await
    }

    fn to_call_result(
        index: usize,
        outcome: hangar_foundation::Result<Value>,
        elapsed: Duration,
        timed_out: &AtomicBool,
    ) -> BatchCallResult {
        match outcome {
            Ok(value) => BatchCallResult {
                index,
                ok: true,
                value: Some(value),
                error_kind: None,
                error: None,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            },
            Err(e) => {
                // 배치 데드라인에 의한 취소는 timeout으로 기록
                let e = match e {
                    Error::Cancelled if timed_out.load(Ordering::SeqCst) => {
                        Error::Timeout("batch deadline exceeded".to_string())
                    }
                    other => other,
                };
                BatchCallResult {
                    index,
                    ok: false,
                    value: None,
                    error_kind: Some(e.kind().to_string()),
                    error: Some(e.to_string()),
                    elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                }
            }
        }
    }
}
