use crate::errors::{ProxyError, ProxyResult};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive upstream failures that trip the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Concurrent probe requests allowed while half-open.
    pub half_open_max_tries: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_tries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CircuitPhase {
    Closed,
    Open { since: Instant },
    HalfOpen { inflight: u32 },
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open { .. } => write!(f, "Open"),
            Self::HalfOpen { inflight } => write!(f, "HalfOpen({})", inflight),
        }
    }
}

struct BreakerState {
    phase: CircuitPhase,
    consecutive_failures: u32,
}

/// Process-global guard in front of upstream dispatch.
///
/// While open, requests fail fast with *ServiceUnavailable* and no network
/// I/O. After `reset_timeout` the breaker half-opens and admits a bounded
/// number of concurrent probes; any probe success closes the circuit, any
/// probe failure reopens it.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
            }),
            config,
        }
    }

    /// Ask permission to dispatch one upstream request. The caller must
    /// report the outcome via [`record_success`] / [`record_failure`].
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    pub async fn try_acquire(&self) -> ProxyResult<()> {
        let mut state = self.state.lock().await;
        match &state.phase {
            CircuitPhase::Closed => Ok(()),
            CircuitPhase::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.reset_timeout {
                    info!(
                        "circuit breaker transitioning Open -> HalfOpen after {}s",
                        elapsed.as_secs()
                    );
                    state.phase = CircuitPhase::HalfOpen { inflight: 1 };
                    Ok(())
                } else {
                    Err(ProxyError::Unavailable(
                        "upstream temporarily unavailable, circuit is open".into(),
                    ))
                }
            }
            CircuitPhase::HalfOpen { inflight } => {
                if *inflight < self.config.half_open_max_tries {
                    state.phase = CircuitPhase::HalfOpen {
                        inflight: inflight + 1,
                    };
                    Ok(())
                } else {
                    Err(ProxyError::Unavailable(
                        "upstream recovery probes already in flight".into(),
                    ))
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        if matches!(state.phase, CircuitPhase::HalfOpen { .. }) {
            info!("circuit breaker probe succeeded: HalfOpen -> Closed");
            state.phase = CircuitPhase::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;
        match &state.phase {
            CircuitPhase::Closed => {
                if failures >= self.config.max_failures {
                    warn!(
                        "circuit breaker tripped after {} consecutive failures: Closed -> Open",
                        failures
                    );
                    state.phase = CircuitPhase::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitPhase::HalfOpen { .. } => {
                warn!("circuit breaker probe failed: HalfOpen -> Open");
                state.phase = CircuitPhase::Open {
                    since: Instant::now(),
                };
            }
            CircuitPhase::Open { .. } => {}
        }
    }

    /// Current phase name, for the detailed health endpoint.
    pub async fn phase_name(&self) -> String {
        self.state.lock().await.phase.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_millis(0),
            half_open_max_tries: 2,
        }
    }

    async fn trip(breaker: &CircuitBreaker, failures: u32) {
        for _ in 0..failures {
            breaker.try_acquire().await.unwrap();
            breaker.record_failure().await;
        }
    }

    #[tokio::test]
    async fn closed_allows_requests() {
        let breaker = CircuitBreaker::new(test_config());
        assert!(breaker.try_acquire().await.is_ok());
        assert_eq!(breaker.phase_name().await, "Closed");
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            reset_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let breaker = CircuitBreaker::new(config);
        trip(&breaker, 3).await;

        let err = breaker.try_acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::Unavailable(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let breaker = CircuitBreaker::new(test_config());
        trip(&breaker, 2).await;
        assert!(breaker.try_acquire().await.is_ok());
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let breaker = CircuitBreaker::new(test_config());
        trip(&breaker, 2).await;
        breaker.try_acquire().await.unwrap();
        breaker.record_success().await;
        // two more failures should not trip (counter was reset at 2/3)
        trip(&breaker, 2).await;
        assert!(breaker.try_acquire().await.is_ok());
    }

    #[tokio::test]
    async fn half_open_after_reset_timeout() {
        let breaker = CircuitBreaker::new(test_config());
        trip(&breaker, 3).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.try_acquire().await.is_ok());
        assert_eq!(breaker.phase_name().await, "HalfOpen(1)");
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let breaker = CircuitBreaker::new(test_config());
        trip(&breaker, 3).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(breaker.try_acquire().await.is_ok()); // probe 1 (via Open -> HalfOpen)
        assert!(breaker.try_acquire().await.is_ok()); // probe 2
        let err = breaker.try_acquire().await.unwrap_err(); // cap reached
        assert!(matches!(err, ProxyError::Unavailable(_)));
    }

    #[tokio::test]
    async fn probe_success_closes() {
        let breaker = CircuitBreaker::new(test_config());
        trip(&breaker, 3).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        breaker.try_acquire().await.unwrap();
        breaker.record_success().await;
        assert_eq!(breaker.phase_name().await, "Closed");
        assert!(breaker.try_acquire().await.is_ok());
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Duration::from_millis(0),
            half_open_max_tries: 2,
        };
        let breaker = CircuitBreaker::new(config);
        trip(&breaker, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        breaker.try_acquire().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.phase_name().await, "Open");
    }
}
