//! Bounded retry with exponential backoff and jitter, expressed as an
//! explicit state machine.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::SourceError;

/// Exponential backoff: `base * 2^retry`, capped at `max`, then spread by
/// `+/- jitter_ratio` of the delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self { base, max, jitter_ratio: jitter_ratio.clamp(0.0, 1.0) }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let scale = 2_f64.powi(retry.min(30) as i32);
        let seconds = (self.base.as_secs_f64() * scale).min(self.max.as_secs_f64());

        if self.jitter_ratio == 0.0 || seconds == 0.0 {
            return Duration::from_secs_f64(seconds);
        }

        // Uniform in [1 - r, 1 + r] so concurrent cities do not retry in lockstep.
        let factor = 1.0 - self.jitter_ratio + 2.0 * self.jitter_ratio * fastrand::f64();
        Duration::from_secs_f64((seconds * factor).max(0.0))
    }
}

/// What the controller hands back once the operation can no longer be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The caller has another source to try.
    Fallback,
    /// Nothing left to try.
    Fail,
}

/// Retry policy for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub on_exhausted: Exhaustion,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, on_exhausted: Exhaustion) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff, on_exhausted }
    }

    /// Policy for a primary source, handing off to the fallback on exhaustion.
    pub fn primary(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, Self::backoff_from(cfg), Exhaustion::Fallback)
    }

    /// Policy for a fallback source, failing outright on exhaustion.
    pub fn fallback(cfg: &RetryConfig) -> Self {
        Self::new(cfg.fallback_attempts, Self::backoff_from(cfg), Exhaustion::Fail)
    }

    fn backoff_from(cfg: &RetryConfig) -> Backoff {
        Backoff::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.jitter_ratio,
        )
    }

    /// State after attempt number `attempt` (1-based) produced `outcome`.
    pub fn next_state<T>(&self, attempt: u32, outcome: Result<T, SourceError>) -> RetryState<T> {
        match outcome {
            Ok(value) => RetryState::Succeeded { attempts: attempt, value },
            Err(error) if error.is_transient() && attempt < self.max_attempts => {
                RetryState::Backoff { attempt, delay: self.backoff.delay(attempt - 1) }
            }
            Err(error) => match self.on_exhausted {
                Exhaustion::Fallback => RetryState::FallbackPending { attempts: attempt, error },
                Exhaustion::Fail => RetryState::Failed { attempts: attempt, error },
            },
        }
    }
}

/// States of one retried call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState<T> {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    FallbackPending { attempts: u32, error: SourceError },
    Failed { attempts: u32, error: SourceError },
    Succeeded { attempts: u32, value: T },
}

impl<T> RetryState<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::FallbackPending { .. } | RetryState::Failed { .. } | RetryState::Succeeded { .. }
        )
    }
}

/// A successful result and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Classified failure returned once retries are exhausted or the error was permanent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("gave up after {attempts} attempt(s): {error}")]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: SourceError,
    pub next: Exhaustion,
}

/// Run `operation` under `policy`. The closure receives the 1-based attempt
/// number. Backoff sleeps on the tokio timer, so other tasks keep running.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<Retried<T>, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut state = RetryState::Attempting { attempt: 1 };

    loop {
        state = match state {
            RetryState::Attempting { attempt } => {
                let outcome = operation(attempt).await;
                if let Err(err) = &outcome {
                    warn!(
                        source = label,
                        attempt,
                        max_attempts = policy.max_attempts,
                        transient = err.is_transient(),
                        "attempt failed: {err}"
                    );
                }
                policy.next_state(attempt, outcome)
            }
            RetryState::Backoff { attempt, delay } => {
                debug!(source = label, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;
                RetryState::Attempting { attempt: attempt + 1 }
            }
            RetryState::Succeeded { attempts, value } => {
                return Ok(Retried { value, attempts });
            }
            RetryState::FallbackPending { attempts, error } => {
                return Err(RetryFailure { attempts, error, next: Exhaustion::Fallback });
            }
            RetryState::Failed { attempts, error } => {
                return Err(RetryFailure { attempts, error, next: Exhaustion::Fail });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(base_ms: u64, max_ms: u64) -> Backoff {
        Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms), 0.0)
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = no_jitter(100, 1_000);

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1)); // capped
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.5);

        for _ in 0..50 {
            for retry in 0..4 {
                let expected = 100.0 * 2_f64.powi(retry as i32);
                let ms = backoff.delay(retry).as_secs_f64() * 1_000.0;
                assert!(ms >= expected * 0.5 - 1e-6, "retry={retry} ms={ms}");
                assert!(ms <= expected * 1.5 + 1e-6, "retry={retry} ms={ms}");
            }
        }
    }

    #[test]
    fn transitions_follow_error_class() {
        let policy = RetryPolicy::new(3, no_jitter(10, 100), Exhaustion::Fallback);

        let s: RetryState<()> = policy.next_state(1, Err(SourceError::RateLimited));
        assert_eq!(s, RetryState::Backoff { attempt: 1, delay: Duration::from_millis(10) });

        let s: RetryState<()> = policy.next_state(2, Err(SourceError::Timeout("t".into())));
        assert_eq!(s, RetryState::Backoff { attempt: 2, delay: Duration::from_millis(20) });

        let s: RetryState<()> = policy.next_state(3, Err(SourceError::Timeout("t".into())));
        assert!(matches!(s, RetryState::FallbackPending { attempts: 3, .. }));

        let permanent = SourceError::Http { status: 404, body: String::new() };
        let s: RetryState<()> = policy.next_state(1, Err(permanent));
        assert!(matches!(s, RetryState::FallbackPending { attempts: 1, .. }));

        let s = policy.next_state(2, Ok(7));
        assert_eq!(s, RetryState::Succeeded { attempts: 2, value: 7 });
        assert!(s.is_terminal());
    }

    #[test]
    fn fallback_policy_ends_in_failed() {
        let policy = RetryPolicy::fallback(&RetryConfig::default());
        let s: RetryState<()> = policy.next_state(1, Err(SourceError::RateLimited));
        assert!(matches!(s, RetryState::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy::new(3, no_jitter(0, 0), Exhaustion::Fallback);
        let calls = AtomicU32::new(0);

        let result = execute_with_retry(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 { Err(SourceError::from_status(503, "")) } else { Ok("ok") }
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(result, Retried { value: "ok", attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(5, no_jitter(0, 0), Exhaustion::Fallback);
        let calls = AtomicU32::new(0);

        let err = execute_with_retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SourceError::Http { status: 401, body: "no".into() }) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.next, Exhaustion::Fallback);
    }

    #[tokio::test]
    async fn exhaustion_is_bounded() {
        let policy = RetryPolicy::new(3, no_jitter(0, 0), Exhaustion::Fail);
        let calls = AtomicU32::new(0);

        let err = execute_with_retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SourceError::Connect("reset".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.next, Exhaustion::Fail);
        assert_eq!(err.error, SourceError::Connect("reset".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_on_the_tokio_clock() {
        let policy = RetryPolicy::new(3, no_jitter(1_000, 60_000), Exhaustion::Fallback);
        let started = tokio::time::Instant::now();

        let _ = execute_with_retry(&policy, "test", |_| async {
            Err::<(), _>(SourceError::RateLimited)
        })
        .await;

        // 1s after the first attempt, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
