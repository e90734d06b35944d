//! 전역 요청 속도 제한 (token bucket)
//!
//! rps 설정만큼 토큰이 초당 채워지고, 버스트 용량은 rps와 같습니다.
//! 토큰이 없으면 즉시 거부합니다 (대기 없음).

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket 속도 제한기
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// rps 기준으로 생성 (용량 = 버스트 = rps)
    pub fn new(rps: u32) -> Self {
        let capacity = f64::from(rps.max(1));
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 토큰 하나 소비 시도. 비어있으면 false.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket poisoned");

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// 현재 남은 토큰 (진단용)
    pub fn available(&self) -> f64 {
        let state = self.state.lock().expect("bucket poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::new(2);

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_refills_over_time() {
        let bucket = TokenBucket::new(10);

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // 10 rps → 200ms면 약 2토큰
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_capacity_capped() {
        let bucket = TokenBucket::new(3);
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.available() <= 3.0);
    }
}
