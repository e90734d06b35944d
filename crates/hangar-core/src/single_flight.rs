//! Single-flight execution for cold starts
//!
//! Collapses concurrent start attempts into one: the first caller runs the
//! operation, everyone who arrives while it is in flight waits and observes
//! the same outcome. Results are not cached; once the flight lands, the next
//! caller starts a fresh one.

use hangar_foundation::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Outcome broadcast to waiting callers.
#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    Done(std::result::Result<(), Error>),
}

/// Single-flight gate for one logical operation.
pub struct SingleFlight {
    slot: Arc<Mutex<Option<watch::Receiver<FlightState>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `operation`, or wait for the in-flight one and share its outcome.
    pub async fn run<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // Join an existing flight if one is in progress.
        let leader_tx = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(rx) => {
                    let mut rx = rx.clone();
                    drop(slot);
                    return Self::wait(&mut rx).await;
                }
                None => {
                    let (tx, rx) = watch::channel(FlightState::Pending);
                    *slot = Some(rx);
                    tx
                }
            }
        };

        // Leader path: execute, publish, clear the slot.
        let outcome = operation().await;
        let _ = leader_tx.send(FlightState::Done(outcome.clone()));
        *self.slot.lock().await = None;

        outcome
    }

    /// Wait for the leader's published outcome.
    async fn wait(rx: &mut watch::Receiver<FlightState>) -> Result<()> {
        loop {
            if let FlightState::Done(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Leader dropped without publishing (task aborted mid-start)
                return Err(Error::Internal("start attempt aborted".to_string()));
            }
        }
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run(|| async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_shared_by_all_waiters() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run(|| async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(Error::cold_start("math", "spawn failed"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "provider_cold_start_failed");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_rerun() {
        let flight = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            flight
                .run(|| async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        // No result caching: each completed flight allows a new one
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }
}
