// # Circuit Breaker
//
// Failure-rate state machine wrapping an arbitrary "produce a value"
// operation, with a caller-supplied fallback value.
//
// The breaker knows nothing about HTTP, retries, or sources: it is handed
// an async operation and reports one of three outcomes. This keeps it
// reusable and independently testable, and keeps it decoupled from the
// cache even though fallbacks usually originate there.
//
// ## State machine
//
// - CLOSED -> OPEN: after `failure_threshold` consecutive failures
// - OPEN -> HALF_OPEN: lazily, at the first call after `recovery_timeout`
// - HALF_OPEN -> CLOSED: the probe succeeds; failure count resets
// - HALF_OPEN -> OPEN: the probe fails; the cooldown restarts
//
// While OPEN within the cooldown the wrapped operation is never invoked.
// At most one HALF_OPEN probe is in flight at a time; concurrent callers
// are served the fallback instead of piling onto the recovering service.
// The probe slot carries its claim time: a caller can drop the execute
// future mid-probe, so a slot older than `recovery_timeout` is treated as
// abandoned and handed to the next caller.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::Result;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Short-circuiting; the fallback is served without invoking the operation
    Open,
    /// A single trial operation is allowed through
    HalfOpen,
}

/// Outcome of a breaker-mediated call
///
/// An explicit result type instead of exception-style flow control: callers
/// can branch on "really resolved" vs "served from fallback" vs "nothing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerOutcome<T> {
    /// The wrapped operation ran and succeeded
    Success(T),
    /// The operation was skipped or failed; the fallback value was served
    Fallback(T),
    /// The operation was skipped or failed and no fallback was available
    Exhausted,
}

impl<T> BreakerOutcome<T> {
    /// The carried value, whether fresh or fallback
    pub fn into_value(self) -> Option<T> {
        match self {
            BreakerOutcome::Success(v) | BreakerOutcome::Fallback(v) => Some(v),
            BreakerOutcome::Exhausted => None,
        }
    }
}

/// Point-in-time breaker state for introspection
#[derive(Debug, Clone)]
pub struct BreakerSnapshot<T> {
    pub state: CircuitState,
    /// Consecutive failures observed in CLOSED
    pub failure_count: usize,
    /// Seconds since the most recent failure, if any
    pub seconds_since_failure: Option<f64>,
    /// Seconds until a HALF_OPEN probe is allowed (0 unless OPEN)
    pub seconds_until_probe: f64,
    pub last_known_good: Option<T>,
}

#[derive(Debug)]
struct BreakerInner<T> {
    state: CircuitState,
    failure_count: usize,
    last_failure: Option<Instant>,
    /// When the in-flight HALF_OPEN probe claimed its slot; blocks
    /// concurrent probes until cleared or older than the cooldown
    probe_started: Option<Instant>,
    last_known_good: Option<T>,
}

/// Circuit breaker over operations producing a `T`
#[derive(Debug)]
pub struct CircuitBreaker<T> {
    failure_threshold: usize,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner<T>>,
}

impl<T: Clone> CircuitBreaker<T> {
    /// Create a breaker from configuration
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_started: None,
                last_known_good: None,
            }),
        }
    }

    /// Execute an operation through the breaker, serving `fallback` when the
    /// circuit is open or the operation fails.
    ///
    /// On success the result becomes the new last-known-good value. The
    /// state lock is not held across the operation itself.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        operation: F,
        fallback: Option<T>,
    ) -> BreakerOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|at| at.elapsed())
                        .unwrap_or(self.recovery_timeout);
                    if elapsed < self.recovery_timeout {
                        tracing::debug!(
                            "circuit open, {}s until probe; serving fallback",
                            (self.recovery_timeout - elapsed).as_secs()
                        );
                        return Self::serve_fallback(fallback);
                    }
                    tracing::info!("circuit transitioning from open to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(Instant::now());
                }
                CircuitState::HalfOpen => {
                    let slot_held = inner
                        .probe_started
                        .map(|at| at.elapsed() < self.recovery_timeout)
                        .unwrap_or(false);
                    if slot_held {
                        // Another caller holds the probe slot
                        return Self::serve_fallback(fallback);
                    }
                    // Slot is free, or its holder abandoned the probe
                    inner.probe_started = Some(Instant::now());
                }
            }
        }

        match operation().await {
            Ok(value) => {
                let mut inner = self.inner.lock().await;
                if inner.state == CircuitState::HalfOpen {
                    tracing::info!("circuit transitioning from half-open to closed");
                }
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe_started = None;
                inner.last_known_good = Some(value.clone());
                BreakerOutcome::Success(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.last_failure = Some(Instant::now());
                inner.probe_started = None;
                match inner.state {
                    CircuitState::HalfOpen => {
                        tracing::warn!("probe failed, circuit reopening: {}", e);
                        inner.state = CircuitState::Open;
                    }
                    CircuitState::Closed => {
                        inner.failure_count += 1;
                        tracing::debug!(
                            "circuit failure {}/{}: {}",
                            inner.failure_count,
                            self.failure_threshold,
                            e
                        );
                        if inner.failure_count >= self.failure_threshold {
                            tracing::warn!("circuit opening after repeated failures");
                            inner.state = CircuitState::Open;
                        }
                    }
                    CircuitState::Open => {}
                }
                drop(inner);
                Self::serve_fallback(fallback)
            }
        }
    }

    fn serve_fallback(fallback: Option<T>) -> BreakerOutcome<T> {
        match fallback {
            Some(value) => BreakerOutcome::Fallback(value),
            None => BreakerOutcome::Exhausted,
        }
    }

    /// Current state for introspection
    pub async fn snapshot(&self) -> BreakerSnapshot<T> {
        let inner = self.inner.lock().await;
        let seconds_since_failure = inner.last_failure.map(|at| at.elapsed().as_secs_f64());
        let seconds_until_probe = match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => {
                (self.recovery_timeout.saturating_sub(at.elapsed())).as_secs_f64()
            }
            _ => 0.0,
        };

        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            seconds_since_failure,
            seconds_until_probe,
            last_known_good: inner.last_known_good.clone(),
        }
    }

    /// Last value a successful operation produced, if any
    pub async fn last_known_good(&self) -> Option<T> {
        self.inner.lock().await.last_known_good.clone()
    }

    /// Remember a known-good value without running an operation.
    ///
    /// Used to seed the breaker with a persisted last-known address.
    pub async fn seed_last_known_good(&self, value: T) {
        self.inner.lock().await.last_known_good = Some(value);
    }

    /// Force the breaker back to CLOSED with a zero failure count
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        tracing::info!("circuit breaker reset to closed");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(threshold: usize, recovery_secs: u64) -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
        }
    }

    fn fail() -> crate::error::Result<String> {
        Err(Error::Other("boom".into()))
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(&config(3, 120));

        for _ in 0..2 {
            let out = breaker
                .execute_with_fallback(|| async { fail() }, None)
                .await;
            assert_eq!(out, BreakerOutcome::Exhausted);
        }
        assert_eq!(breaker.snapshot().await.state, CircuitState::Closed);

        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(&config(3, 120));

        for _ in 0..2 {
            breaker
                .execute_with_fallback(|| async { fail() }, None)
                .await;
        }
        let out = breaker
            .execute_with_fallback(|| async { Ok("1.2.3.4".to_string()) }, None)
            .await;
        assert_eq!(out, BreakerOutcome::Success("1.2.3.4".to_string()));

        let snap = breaker.snapshot().await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.last_known_good, Some("1.2.3.4".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_operation_until_timeout() {
        let breaker = CircuitBreaker::new(&config(1, 120));
        let calls = Arc::new(AtomicUsize::new(0));

        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);

        // Within the cooldown: operation never invoked, fallback served
        let c = calls.clone();
        let out = breaker
            .execute_with_fallback(
                || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                },
                Some("cached".to_string()),
            )
            .await;
        assert_eq!(out, BreakerOutcome::Fallback("cached".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // After the cooldown the probe goes through and closes the circuit
        tokio::time::advance(Duration::from_secs(121)).await;
        let c = calls.clone();
        let out = breaker
            .execute_with_fallback(
                || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                },
                Some("cached".to_string()),
            )
            .await;
        assert_eq!(out, BreakerOutcome::Success("fresh".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.snapshot().await.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new(&config(1, 60));

        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let out = breaker
            .execute_with_fallback(|| async { fail() }, Some("cached".to_string()))
            .await;
        assert_eq!(out, BreakerOutcome::Fallback("cached".to_string()));

        let snap = breaker.snapshot().await;
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.seconds_until_probe > 59.0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_probe() {
        let breaker = Arc::new(CircuitBreaker::new(&config(1, 60)));
        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        // A slow probe claims the half-open slot
        let probing = breaker.clone();
        let probe = tokio::spawn(async move {
            probing
                .execute_with_fallback(
                    || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok("fresh".to_string())
                    },
                    None,
                )
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.snapshot().await.state, CircuitState::HalfOpen);

        // A concurrent caller is served the fallback, its operation unused
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let out = breaker
            .execute_with_fallback(
                || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok("second".to_string())
                },
                Some("cached".to_string()),
            )
            .await;
        assert_eq!(out, BreakerOutcome::Fallback("cached".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            probe.await.unwrap(),
            BreakerOutcome::Success("fresh".to_string())
        );
        assert_eq!(breaker.snapshot().await.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_frees_the_slot_after_cooldown() {
        let breaker = CircuitBreaker::new(&config(1, 60));
        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        // The caller gives up on the probe mid-flight
        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            breaker.execute_with_fallback(
                || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("never".to_string())
                },
                None,
            ),
        )
        .await;
        assert!(attempt.is_err());

        // Within the cooldown the slot still reads as held
        let out = breaker
            .execute_with_fallback(
                || async { Ok("fresh".to_string()) },
                Some("cached".to_string()),
            )
            .await;
        assert_eq!(out, BreakerOutcome::Fallback("cached".to_string()));

        // Past the cooldown the slot is reclaimed and the probe runs
        tokio::time::advance(Duration::from_secs(61)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let out = breaker
            .execute_with_fallback(
                || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                },
                Some("cached".to_string()),
            )
            .await;
        assert_eq!(out, BreakerOutcome::Success("fresh".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.snapshot().await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let breaker = CircuitBreaker::new(&config(1, 120));
        breaker
            .execute_with_fallback(|| async { fail() }, None)
            .await;
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);

        breaker.reset().await;
        let snap = breaker.snapshot().await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test]
    async fn failure_with_fallback_serves_fallback() {
        let breaker = CircuitBreaker::new(&config(5, 120));
        let out = breaker
            .execute_with_fallback(|| async { fail() }, Some("cached".to_string()))
            .await;
        assert_eq!(out, BreakerOutcome::Fallback("cached".to_string()));
        assert_eq!(breaker.snapshot().await.failure_count, 1);
        assert_eq!(
            BreakerOutcome::Fallback("cached".to_string()).into_value(),
            Some("cached".to_string())
        );
        assert_eq!(BreakerOutcome::<String>::Exhausted.into_value(), None);
    }

    #[tokio::test]
    async fn seeded_value_survives_until_first_success() {
        let breaker = CircuitBreaker::new(&config(5, 120));
        breaker.seed_last_known_good("9.9.9.9".to_string()).await;
        assert_eq!(
            breaker.last_known_good().await,
            Some("9.9.9.9".to_string())
        );

        breaker
            .execute_with_fallback(|| async { Ok("1.2.3.4".to_string()) }, None)
            .await;
        assert_eq!(
            breaker.last_known_good().await,
            Some("1.2.3.4".to_string())
        );
    }
}
