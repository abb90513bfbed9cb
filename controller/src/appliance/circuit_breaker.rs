//! A three-state circuit breaker wrapping the appliance command path.
//!
//! closed -> open on a failure ratio over a sliding window; open -> half-open
//! after a cooldown; half-open -> closed on N consecutive successes, or back
//! to open on a single failure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// How far back the failure ratio is computed over.
    pub window: Duration,
    /// Minimum number of calls in the window before the ratio is evaluated.
    pub min_calls: usize,
    /// Fraction of calls in the window that must fail to trip the breaker.
    pub failure_ratio: f64,
    /// How long the breaker stays open before allowing a half-open probe.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close the breaker.
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_calls: 5,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(30),
            half_open_successes_to_close: 3,
        }
    }
}

struct Inner {
    state: State,
    events: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// Per-remote-endpoint circuit breaker. One instance guards all commands
/// sent to a single appliance over its SSH session.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                events: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// Run `f` through the breaker: rejected immediately if open and still
    /// cooling down, otherwise executed and the outcome recorded.
    pub async fn call<T, E, Fut>(&self, f: Fut) -> Result<T, CircuitBreakerError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.permit_call().await {
            return Err(CircuitBreakerError::Open);
        }
        match f.await {
            Ok(v) => {
                self.record(true).await;
                Ok(v)
            }
            Err(e) => {
                self.record(false).await;
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    async fn permit_call(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.config.cooldown {
                    info!("circuit breaker cooldown elapsed, entering half-open");
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                    metrics::record_circuit_breaker_transition("half_open");
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_successes_to_close {
                        info!("circuit breaker closing after consecutive half-open successes");
                        inner.state = State::Closed;
                        inner.events.clear();
                        inner.opened_at = None;
                        metrics::record_circuit_breaker_transition("closed");
                    }
                } else {
                    warn!("half-open probe failed, reopening circuit breaker");
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_successes = 0;
                    metrics::record_circuit_breaker_transition("open");
                }
            }
            State::Closed => {
                let now = Instant::now();
                inner.events.push_back((now, success));
                let window = self.config.window;
                while let Some((ts, _)) = inner.events.front() {
                    if now.duration_since(*ts) > window {
                        inner.events.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.events.len() >= self.config.min_calls {
                    let failures = inner.events.iter().filter(|(_, ok)| !ok).count();
                    let ratio = failures as f64 / inner.events.len() as f64;
                    if ratio >= self.config.failure_ratio {
                        warn!(ratio, "failure ratio over threshold, opening circuit breaker");
                        inner.state = State::Open;
                        inner.opened_at = Some(now);
                        inner.events.clear();
                        metrics::record_circuit_breaker_transition("open");
                    }
                }
            }
            State::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window: Duration::from_secs(60),
            min_calls: 2,
            failure_ratio: 0.5,
            cooldown: Duration::from_millis(20),
            half_open_successes_to_close: 2,
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new(fast_config());
        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_failure_ratio_exceeded() {
        let cb = CircuitBreaker::new(fast_config());
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(cb.state().await, State::Open);
    }

    #[tokio::test]
    async fn rejects_calls_while_open() {
        let cb = CircuitBreaker::new(fast_config());
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_successes() {
        let cb = CircuitBreaker::new(fast_config());
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, State::HalfOpen);
        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(cb.state().await, State::Open);
    }
}
