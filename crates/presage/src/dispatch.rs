// Window Dispatcher: drives every (machine, window) work item to a terminal
// state under a bounded concurrency budget, applying the retry policy per
// item. Emits one outcome per finished item over the outcome channel, in
// completion order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::WindowFetcher;
use crate::frame::PredictionFrame;
use crate::plan::TimeWindow;
use crate::retry::{AttemptResult, RetryPolicy, WorkState};
use crate::schemas::Machine;

/// One (machine, window) unit of dispatch.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub machine: Arc<Machine>,
    pub window: TimeWindow,
}

/// Terminal result of one work item's retry sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        frame: PredictionFrame,
        resampled: Option<PredictionFrame>,
    },
    Failure {
        message: String,
        retryable: bool,
    },
}

impl Outcome {
    pub fn failure(message: impl Into<String>, retryable: bool) -> Self {
        Self::Failure {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A terminal outcome tagged with the work item it belongs to.
#[derive(Debug, Clone)]
pub struct WindowOutcome {
    pub machine: Arc<Machine>,
    pub window: TimeWindow,
    /// Attempts actually executed, including the successful or final one.
    pub attempts: u32,
    pub outcome: Outcome,
}

/// Dispatch counters for observability and tests.
///
/// All counters use atomic operations for thread-safe access.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Attempts entered, including retries.
    pub attempts_total: AtomicU64,
    /// Attempts that were retried after a transient failure.
    pub retries_total: AtomicU64,
    /// Work items that reached `Succeeded`.
    pub succeeded_total: AtomicU64,
    /// Work items that reached `Failed`.
    pub failed_total: AtomicU64,
    /// Attempts currently holding a concurrency permit.
    pub in_flight: AtomicUsize,
    /// High-water mark of `in_flight` over the run.
    pub peak_in_flight: AtomicUsize,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter_attempt(&self) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit_attempt(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.succeeded_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            succeeded_total: self.succeeded_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight(),
        }
    }

    /// Log a dispatch summary using tracing.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            attempts = snapshot.attempts_total,
            retries = snapshot.retries_total,
            succeeded = snapshot.succeeded_total,
            failed = snapshot.failed_total,
            peak_in_flight = snapshot.peak_in_flight,
            "Dispatch summary"
        );
    }
}

/// A point-in-time snapshot of the dispatch counters.
#[derive(Debug, Clone)]
pub struct DispatchStatsSnapshot {
    pub attempts_total: u64,
    pub retries_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub peak_in_flight: usize,
}

pub struct WindowDispatcher {
    fetcher: Arc<dyn WindowFetcher>,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
    stats: Arc<DispatchStats>,
    token: CancellationToken,
}

impl WindowDispatcher {
    pub fn new(
        fetcher: Arc<dyn WindowFetcher>,
        policy: RetryPolicy,
        parallelism: usize,
        token: CancellationToken,
    ) -> Self {
        Self::with_limiter(
            fetcher,
            policy,
            Arc::new(Semaphore::new(parallelism)),
            token,
        )
    }

    /// Build a dispatcher around an externally owned concurrency budget.
    pub fn with_limiter(
        fetcher: Arc<dyn WindowFetcher>,
        policy: RetryPolicy,
        limiter: Arc<Semaphore>,
        token: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            policy,
            limiter,
            stats: Arc::new(DispatchStats::new()),
            token,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Execute all work items to a terminal state.
    ///
    /// Outcomes are sent in completion order. Cancellation abandons pending
    /// and in-flight items; outcomes already sent stay valid.
    pub async fn run(&self, items: Vec<WorkItem>, outcome_tx: mpsc::Sender<WindowOutcome>) {
        info!(items = items.len(), "WindowDispatcher started.");
        let mut futures = FuturesUnordered::new();
        for item in items {
            futures.push(Self::drive_item(
                Arc::clone(&self.fetcher),
                self.policy.clone(),
                Arc::clone(&self.limiter),
                Arc::clone(&self.stats),
                self.token.clone(),
                item,
            ));
        }

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    info!(
                        abandoned = futures.len(),
                        "Cancellation received. WindowDispatcher shutting down."
                    );
                    break;
                }

                maybe_outcome = futures.next() => {
                    match maybe_outcome {
                        Some(Some(outcome)) => {
                            if outcome_tx.send(outcome).await.is_err() {
                                error!("Outcome channel closed. Shutting down dispatcher.");
                                break;
                            }
                        }
                        // The item was abandoned mid-flight; nothing to report.
                        Some(None) => {}
                        None => break,
                    }
                }
            }
        }

        self.stats.log_summary();
        info!("WindowDispatcher finished.");
    }

    /// Run one work item's state machine to a terminal state.
    ///
    /// The concurrency permit is held only while an attempt is executing;
    /// backoff delays sleep with the permit released so other pending items
    /// can proceed. Returns `None` when the item was abandoned by
    /// cancellation.
    async fn drive_item(
        fetcher: Arc<dyn WindowFetcher>,
        policy: RetryPolicy,
        limiter: Arc<Semaphore>,
        stats: Arc<DispatchStats>,
        token: CancellationToken,
        item: WorkItem,
    ) -> Option<WindowOutcome> {
        let mut state = WorkState::Pending;
        let mut attempts = 0u32;
        let mut last: Option<Outcome> = None;

        while !state.is_terminal() {
            if let WorkState::Retrying { delay, next_attempt } = state {
                stats.record_retry();
                debug!(
                    machine = %item.machine.name,
                    window = %item.window,
                    attempt = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let permit = tokio::select! {
                _ = token.cancelled() => return None,
                acquired = limiter.acquire() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return None,
                },
            };

            state = state.start();
            stats.enter_attempt();
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    stats.exit_attempt();
                    drop(permit);
                    return None;
                }
                outcome = fetcher.fetch_window(&item.machine, &item.window) => outcome,
            };
            stats.exit_attempt();
            drop(permit);

            attempts += 1;
            let result = match &outcome {
                Outcome::Success { .. } => AttemptResult::Succeeded,
                Outcome::Failure { retryable, .. } => AttemptResult::Failed {
                    retryable: *retryable,
                },
            };
            state = state.settle(result, &policy);
            last = Some(outcome);
        }

        match state {
            WorkState::Succeeded => stats.record_success(),
            WorkState::Failed => {
                stats.record_failure();
                if let Some(Outcome::Failure { message, .. }) = &last {
                    warn!(
                        machine = %item.machine.name,
                        window = %item.window,
                        attempts,
                        error = %message,
                        "Giving up on window"
                    );
                }
            }
            _ => {}
        }

        last.map(|outcome| WindowOutcome {
            machine: Arc::clone(&item.machine),
            window: item.window,
            attempts,
            outcome,
        })
    }
}
