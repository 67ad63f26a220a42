// Retry utility: shared retry-with-backoff logic plus the per-work-item
// lifecycle state machine used by the dispatcher.
//
// Implements exponential backoff with jitter, max delay cap, and explicit
// attempt accounting.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ClientError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2) to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Avoid `Duration` overflow and keep this O(1) even for misconfigured `attempt`.
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Decide what follows a failed attempt (0-indexed).
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if retryable && attempt < self.max_retries {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Re-enter in-flight after waiting out the delay.
    Retry { delay: Duration },
    /// Budget exhausted or the failure is not retryable.
    GiveUp,
}

/// Result of one executed attempt, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Succeeded,
    Failed { retryable: bool },
}

/// Lifecycle of one dispatched work item.
///
/// ```text
/// Pending -> InFlight -> Succeeded
///               |  ^
///               v  |  (retryable, budget left)
///            Retrying
///               |
///               v  (non-retryable or budget exhausted)
///             Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkState {
    /// Queued, waiting for a concurrency permit.
    Pending,
    /// An attempt is executing (0-indexed).
    InFlight { attempt: u32 },
    /// A transient failure is waiting out its backoff delay. The permit is
    /// released for the duration.
    Retrying { next_attempt: u32, delay: Duration },
    /// Terminal: a well-formed response was decoded.
    Succeeded,
    /// Terminal: non-retryable failure or retry budget exhausted.
    Failed,
}

impl WorkState {
    /// Enter the next attempt. Only meaningful from `Pending` or `Retrying`.
    pub fn start(self) -> Self {
        match self {
            Self::Pending => Self::InFlight { attempt: 0 },
            Self::Retrying { next_attempt, .. } => Self::InFlight {
                attempt: next_attempt,
            },
            other => other,
        }
    }

    /// Apply an attempt result under `policy`. Only meaningful from `InFlight`.
    pub fn settle(self, result: AttemptResult, policy: &RetryPolicy) -> Self {
        match (self, result) {
            (Self::InFlight { .. }, AttemptResult::Succeeded) => Self::Succeeded,
            (Self::InFlight { attempt }, AttemptResult::Failed { retryable }) => {
                match policy.decide(attempt, retryable) {
                    RetryDecision::Retry { delay } => Self::Retrying {
                        next_attempt: attempt + 1,
                        delay,
                    },
                    RetryDecision::GiveUp => Self::Failed,
                }
            }
            (other, _) => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed) and
/// returns a [`RetryAction`] indicating whether the result is a success,
/// retryable failure, or permanent failure.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, ClientError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(ClientError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Unreachable: the loop covers 0..=max_retries and the last iteration returns on Retry.
    Err(ClientError::internal("retry loop exited without result"))
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 5xx, timeout).
    Retry(ClientError),
    /// Operation failed with a non-retryable error (4xx, parse error).
    Fail(ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        // attempt 10: 500ms * 2^10 = 512_000ms, should be capped to 5s
        let delay = policy.delay_for_attempt(10);
        assert!(delay <= Duration::from_secs(5));
    }

    #[test]
    fn delay_with_jitter_does_not_exceed_max_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };

        // Run a few times to sample jitter outcomes.
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(10);
            assert!(delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn delay_without_jitter_is_monotonic() {
        let policy = no_jitter(8);
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn decide_honors_budget_and_retryability() {
        let policy = no_jitter(2);
        assert!(matches!(
            policy.decide(0, true),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(1, true),
            RetryDecision::Retry { .. }
        ));
        // Attempt index 2 is the third attempt: budget of 2 retries is spent.
        assert_eq!(policy.decide(2, true), RetryDecision::GiveUp);
        assert_eq!(policy.decide(0, false), RetryDecision::GiveUp);
    }

    #[test]
    fn state_machine_walks_retry_then_success() {
        let policy = no_jitter(3);
        let state = WorkState::Pending.start();
        assert_eq!(state, WorkState::InFlight { attempt: 0 });

        let state = state.settle(AttemptResult::Failed { retryable: true }, &policy);
        assert!(matches!(
            state,
            WorkState::Retrying { next_attempt: 1, .. }
        ));

        let state = state.start();
        assert_eq!(state, WorkState::InFlight { attempt: 1 });

        let state = state.settle(AttemptResult::Succeeded, &policy);
        assert_eq!(state, WorkState::Succeeded);
        assert!(state.is_terminal());
    }

    #[test]
    fn state_machine_fails_on_non_retryable() {
        let policy = no_jitter(3);
        let state = WorkState::Pending
            .start()
            .settle(AttemptResult::Failed { retryable: false }, &policy);
        assert_eq!(state, WorkState::Failed);
        assert!(state.is_terminal());
    }

    #[test]
    fn state_machine_exhausts_budget() {
        let policy = no_jitter(1);
        let mut state = WorkState::Pending;
        let mut attempts = 0;
        while !state.is_terminal() {
            state = state.start();
            attempts += 1;
            state = state.settle(AttemptResult::Failed { retryable: true }, &policy);
        }
        assert_eq!(state, WorkState::Failed);
        // Initial attempt + 1 retry = 2 total
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn retry_succeeds_on_first_attempt() {
        let policy = no_jitter(3);
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(42u32) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_fails_immediately_on_non_retryable() {
        let policy = no_jitter(3);
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(ClientError::prediction_fetch("404 not found", false))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_then_fails() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Retry(ClientError::prediction_fetch("500 internal", true))
            }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt + 2 retries = 3 total
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_respects_cancellation() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(100),
            jitter: false,
        };
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(1u32) }).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }
}
