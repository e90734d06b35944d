//! Health Tracker - provider별 연속 실패 카운터
//!
//! Health Worker의 주기적 프로브와 Dispatch의 실제 호출 결과가 같은
//! 카운터를 갱신합니다. 상태 전이 판단은 Provider Manager가 합니다.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Health 기록 스냅샷 (상태 조회 API용)
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_invocations: u64,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct HealthRecord {
    consecutive_failures: u32,
    total_failures: u64,
    total_invocations: u64,
    last_ok: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Provider별 Health Tracker
#[derive(Debug)]
pub struct HealthTracker {
    max_consecutive_failures: u32,
    record: Mutex<HealthRecord>,
}

impl HealthTracker {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            record: Mutex::new(HealthRecord::default()),
        }
    }

    /// 성공 기록: 연속 실패 카운터 리셋
    pub fn record_success(&self) {
        let mut record = self.record.lock().expect("health record poisoned");
        record.consecutive_failures = 0;
        record.total_invocations += 1;
        let now = Utc::now();
        record.last_ok = Some(now);
        record.last_check = Some(now);
        record.last_error = None;
    }

    /// 실패 기록: 연속 실패 카운터 증가, 임계 도달 여부 반환
    pub fn record_failure(&self, error: &str) -> bool {
        let mut record = self.record.lock().expect("health record poisoned");
        record.consecutive_failures += 1;
        record.total_failures += 1;
        record.total_invocations += 1;
        record.last_check = Some(Utc::now());
        record.last_error = Some(error.to_string());
        record.consecutive_failures >= self.max_consecutive_failures
    }

    /// 연속 실패 횟수
    pub fn consecutive_failures(&self) -> u32 {
        self.record
            .lock()
            .expect("health record poisoned")
            .consecutive_failures
    }

    /// degraded 전환 기준 초과 여부
    pub fn should_degrade(&self) -> bool {
        self.consecutive_failures() >= self.max_consecutive_failures
    }

    /// 스냅샷 조회
    pub fn snapshot(&self) -> HealthSnapshot {
        let record = self.record.lock().expect("health record poisoned");
        HealthSnapshot {
            consecutive_failures: record.consecutive_failures,
            total_failures: record.total_failures,
            total_invocations: record.total_invocations,
            last_ok: record.last_ok,
            last_check: record.last_check,
            last_error: record.last_error.clone(),
        }
    }
}
