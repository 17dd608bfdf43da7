use rand::Rng;
use std::future::Future;
use std::time::Duration;
use streams::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Bounded retry with jittered exponential backoff: `base * 2^attempt`,
/// capped at the ceiling, ±10% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    ceiling: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(10),
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Sleep before retry `attempt` (0-based): `base * 2^attempt` capped at
    /// the ceiling, with ±10% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(30)));
        let capped = exponential.min(self.ceiling);
        capped.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
    }
}

/// Run `op` with up to `max_retries` additional attempts. Only transient
/// errors are retried; anything else terminates the loop immediately, as
/// does cancellation (the in-flight attempt completes, but no fresh attempt
/// starts).
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                if cancel.is_cancelled() {
                    tracing::debug!(what, attempt, "cancelled; not retrying");
                    return Err(err);
                }
                let delay = policy.delay(attempt);
                metrics::counter!("batch_retries").increment(1);
                tracing::warn!(what, attempt, delay_ms = delay.as_millis() as u64, %err, "transient failure; backing off");

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fold per-item failure messages into the batch-granular error: the first
/// five messages verbatim, the remainder summarized as `+N more`.
pub fn delivery_failure(total: usize, failed: usize, mut messages: Vec<String>) -> Error {
    const VERBATIM: usize = 5;
    if messages.len() > VERBATIM {
        let more = messages.len() - VERBATIM;
        messages.truncate(VERBATIM);
        messages.push(format!("+{more} more"));
    }

    if failed >= total {
        Error::TotalFailure { total, messages }
    } else {
        Error::PartialFailure {
            total,
            failed,
            messages,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::transient("test", "throttled")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_the_budget() {
        let policy = RetryPolicy::new(3);
        let attempts = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let result: Result<()> =
            with_retries(&policy, &CancellationToken::new(), "test", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(result, Err(Error::Transient { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        // Total sleep stays within the jittered geometric series:
        // 1s + 2s + 4s, each ±10%.
        let slept = started.elapsed();
        assert!(slept <= Duration::from_millis(7_700), "{slept:?}");
        assert!(slept >= Duration::from_millis(6_300), "{slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_midway() {
        let policy = RetryPolicy::new(5);
        let result = with_retries(&policy, &CancellationToken::new(), "test", |attempt| async move {
            if attempt < 2 {
                Err(transient())
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_fail_fast() {
        let policy = RetryPolicy::new(3);
        let attempts = AtomicU32::new(0);

        let result: Result<()> =
            with_retries(&policy, &CancellationToken::new(), "test", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Config("bad".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_fresh_attempts() {
        let policy = RetryPolicy::new(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retries(&policy, &cancel, "test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        // The in-flight attempt completed, but no retry was started.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_messages_truncate_after_five() {
        let messages: Vec<String> = (0..7).map(|n| format!("m{n}")).collect();
        match delivery_failure(10, 7, messages) {
            Error::PartialFailure {
                total,
                failed,
                messages,
            } => {
                assert_eq!((total, failed), (10, 7));
                assert_eq!(messages, vec!["m0", "m1", "m2", "m3", "m4", "+2 more"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        match delivery_failure(3, 3, vec!["boom".to_string()]) {
            Error::TotalFailure { total, messages } => {
                assert_eq!(total, 3);
                assert_eq!(messages, vec!["boom"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
