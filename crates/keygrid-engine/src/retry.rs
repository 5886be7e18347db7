/*
[INPUT]:  Fallible async exchange operations and a retryability predicate
[OUTPUT]: Final result plus the number of attempts spent
[POS]:    Execution layer - bounded jittered exponential backoff
[UPDATE]: When backoff shape or attempt accounting changes
*/

use std::future::Future;
use std::time::Duration;

use keygrid_exchange::ExchangeError;
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Jittered exponential backoff for transient exchange failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Policy for order placement during a rebuild.
    pub fn for_orders(max_attempts: usize, base_delay_ms: u64) -> Self {
        Self::new(max_attempts, base_delay_ms, base_delay_ms.saturating_mul(8), 0.2)
    }

    pub fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let delay = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(delay)
    }

    /// Retry while `should_retry` accepts the error and attempts remain.
    ///
    /// `delay_hint` lets the error override the computed backoff (rate limits).
    pub async fn retry_when<F, Fut, T, E, P, H>(&self, mut op: F, should_retry: P, delay_hint: H) -> Attempted<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: Fn(&E) -> Option<Duration>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt + 1,
                    };
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !should_retry(&err) {
                        return Attempted {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                    let delay = delay_hint(&err).unwrap_or_else(|| self.next_delay(attempt - 1));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Bound an exchange call. An elapsed deadline is reported as `Timeout`, an unknown outcome.
pub async fn timed<T, F>(limit: Duration, call: F) -> keygrid_exchange::Result<T>
where
    F: Future<Output = keygrid_exchange::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout {
            duration: limit.as_secs(),
        }),
    }
}

/// Venue-requested wait for rate limits; other errors use the computed backoff.
pub fn rate_limit_hint(err: &ExchangeError) -> Option<Duration> {
    match err {
        ExchangeError::RateLimit { retry_after } => Some(Duration::from_secs(*retry_after)),
        _ => None,
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500, 4_000, 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0.0);
        let delays: Vec<_> = (0..4).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(3, 10, 10, 0.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = policy
            .retry_when(
                |attempt| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 { Err("busy") } else { Ok("ok") }
                    }
                },
                |_| true,
                |_| None,
            )
            .await;

        assert_eq!(outcome.result, Ok("ok"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(5, 10, 10, 0.0);
        let outcome: Attempted<(), &str> = policy
            .retry_when(|_| async { Err("rejected") }, |e| *e != "rejected", |_| None)
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result, Err("rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_becomes_timeout() {
        let result: keygrid_exchange::Result<()> = timed(Duration::from_secs(2), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Timeout { duration: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(2, 5, 5, 0.0);
        let outcome: Attempted<(), &str> = policy
            .retry_when(|_| async { Err("busy") }, |_| true, |_| Some(Duration::from_millis(1)))
            .await;
        assert_eq!(outcome.attempts, 2);
    }
}
