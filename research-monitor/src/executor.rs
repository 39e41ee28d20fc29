//! Rate-limited batch executor for judge calls.
//!
//! Runs a batch of independent judge calls under three constraints set by the
//! LLM provider:
//! - at most `concurrency` calls in flight at any instant
//! - successive call starts (retries included) at least `min_request_spacing` apart
//! - rate-limited calls retried with exponential backoff, honoring the provider's hint
//!
//! Results come back in submission order, one per call. Per-call failures are values,
//! never errors of the batch. Calls produce a `Verdict` by default; any other output
//! (digest enrichment, for one) goes through the same limits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::judge::{JudgeError, Verdict};

pub type JudgeFuture<T = Verdict> = Pin<Box<dyn Future<Output = Result<T, JudgeError>> + Send>>;

/// Limits applied to one executor. Built explicitly, never read from globals.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub min_request_spacing: Duration,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub call_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: common::DEFAULT_CONCURRENCY,
            min_request_spacing: Duration::from_millis(1500),
            max_retries: common::DEFAULT_MAX_RETRIES,
            initial_retry_delay: Duration::from_secs(2),
            call_timeout: None,
        }
    }
}

impl From<&common::RateLimitConfig> for ExecutorConfig {
    fn from(cfg: &common::RateLimitConfig) -> Self {
        Self {
            concurrency: cfg.concurrency().max(1),
            min_request_spacing: cfg.request_delay(),
            max_retries: cfg.max_retries(),
            initial_retry_delay: cfg.initial_retry_delay(),
            call_timeout: cfg.call_timeout(),
        }
    }
}

/// Wait before retry number `retry` (1-indexed): the larger of the provider hint
/// and `initial * 2^(retry-1)`.
pub fn retry_delay(retry: u32, initial: Duration, provider_hint: Option<Duration>) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    let exponential = initial.saturating_mul(factor);
    match provider_hint {
        Some(hint) => exponential.max(hint),
        None => exponential,
    }
}

/// A labelled, re-invocable judge call. Each invocation is one attempt.
pub struct JudgeCall<T = Verdict> {
    pub label: String,
    run: Arc<dyn Fn() -> JudgeFuture<T> + Send + Sync>,
}

impl<T: 'static> JudgeCall<T> {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, JudgeError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Arc::new(move || Box::pin(f())),
        }
    }

    fn invoke(&self) -> JudgeFuture<T> {
        (self.run)()
    }
}

impl<T> Clone for JudgeCall<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            run: self.run.clone(),
        }
    }
}

impl<T> std::fmt::Debug for JudgeCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeCall").field("label", &self.label).finish()
    }
}

/// Cancellation handle shared between the batch and whoever may interrupt it.
#[derive(Debug, Clone)]
pub struct CancelBatch {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelBatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal per-call failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("judge error: {0}")]
    Judge(String),

    #[error("still rate limited after {attempts} attempts")]
    RetryBudgetExhausted {
        attempts: u32,
        last_retry_after: Option<Duration>,
    },

    #[error("batch cancelled before the call completed")]
    BatchCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    RateLimited { retry_after: Option<Duration> },
    Failed(String),
}

/// Record of one attempt; exists only for the lifetime of the batch result.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub attempt_number: u32,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct CallOutcome<T = Verdict> {
    pub label: String,
    pub result: Result<T, CallError>,
    pub attempts: Vec<CallAttempt>,
}

impl<T> CallOutcome<T> {
    fn terminal(label: String, error: CallError, attempts: Vec<CallAttempt>) -> Self {
        Self {
            label,
            result: Err(error),
            attempts,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// When the last attempt returned, if any attempt ran
    pub fn completed_at(&self) -> Option<Instant> {
        self.attempts.last().map(|a| a.finished_at)
    }
}

/// Serializes call starts so that two starts are never closer than `spacing`.
#[derive(Debug)]
struct Pacer {
    spacing: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_start: Mutex::new(None),
        }
    }

    /// Wait for the next start slot and claim it.
    async fn wait_turn(&self) -> Instant {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.spacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }
}

/// Clones share one pacer, so batches run through clones are spaced against each other.
#[derive(Clone)]
pub struct RateLimitedBatchExecutor {
    config: ExecutorConfig,
    pacer: Arc<Pacer>,
}

impl RateLimitedBatchExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let pacer = Arc::new(Pacer::new(config.min_request_spacing));
        Self { config, pacer }
    }

    /// Run every call and return one outcome per call, in submission order.
    ///
    /// Calls start in submission order as concurrency slots free up. Once `cancel`
    /// fires, calls that have not started never start and resolve to
    /// `CallError::BatchCancelled`; an attempt already in flight is awaited.
    pub async fn run_all<T: Send + 'static>(&self, calls: Vec<JudgeCall<T>>, cancel: &CancelBatch) -> Vec<CallOutcome<T>> {
        let total = calls.len();
        info!(
            calls = total,
            concurrency = self.config.concurrency,
            spacing_ms = self.config.min_request_spacing.as_millis() as u64,
            max_retries = self.config.max_retries,
            "executor: starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let labels: Vec<String> = calls.iter().map(|c| c.label.clone()).collect();
        let mut slots: Vec<Option<CallOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, call) in calls.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!(label = %call.label, "executor: not started, batch cancelled");
                slots[index] = Some(CallOutcome::terminal(call.label, CallError::BatchCancelled, Vec::new()));
                continue;
            };

            let pacer = self.pacer.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { (index, drive_call(call, permit, pacer, config, cancel).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "executor: judge call task failed"),
            }
        }

        let outcomes: Vec<CallOutcome<T>> = slots
            .into_iter()
            .zip(labels)
            .map(|(slot, label)| {
                slot.unwrap_or_else(|| {
                    CallOutcome::terminal(label, CallError::Judge("judge call panicked".to_string()), Vec::new())
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let cancelled = outcomes
            .iter()
            .filter(|o| matches!(o.result, Err(CallError::BatchCancelled)))
            .count();
        info!(
            calls = total,
            succeeded,
            failed = total - succeeded - cancelled,
            cancelled,
            "executor: batch finished"
        );
        outcomes
    }
}

/// Drive one call to a terminal outcome. The concurrency permit is held for the
/// whole call, backoff waits included.
async fn drive_call<T: Send + 'static>(
    call: JudgeCall<T>,
    permit: OwnedSemaphorePermit,
    pacer: Arc<Pacer>,
    config: ExecutorConfig,
    cancel: CancelBatch,
) -> CallOutcome<T> {
    let _permit = permit;
    let mut attempts: Vec<CallAttempt> = Vec::new();
    let mut attempt_number: u32 = 0;

    loop {
        attempt_number += 1;

        let started_at = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(label = %call.label, attempt = attempt_number, "executor: cancelled before start");
                return CallOutcome::terminal(call.label, CallError::BatchCancelled, attempts);
            }
            started = pacer.wait_turn() => started,
        };
        debug!(label = %call.label, attempt = attempt_number, "executor: call started");

        let result = match config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call.invoke()).await {
                Ok(result) => result,
                Err(_) => Err(JudgeError::Failed(format!("timed out after {:?}", limit))),
            },
            None => call.invoke().await,
        };
        let finished_at = Instant::now();

        match result {
            Ok(output) => {
                attempts.push(CallAttempt {
                    attempt_number,
                    started_at,
                    finished_at,
                    outcome: AttemptOutcome::Success,
                });
                return CallOutcome {
                    label: call.label,
                    result: Ok(output),
                    attempts,
                };
            }
            Err(JudgeError::RateLimited { retry_after }) => {
                attempts.push(CallAttempt {
                    attempt_number,
                    started_at,
                    finished_at,
                    outcome: AttemptOutcome::RateLimited { retry_after },
                });

                if attempt_number > config.max_retries {
                    warn!(label = %call.label, attempts = attempt_number, "executor: retry budget exhausted");
                    return CallOutcome::terminal(
                        call.label,
                        CallError::RetryBudgetExhausted {
                            attempts: attempt_number,
                            last_retry_after: retry_after,
                        },
                        attempts,
                    );
                }
                if cancel.is_cancelled() {
                    return CallOutcome::terminal(call.label, CallError::BatchCancelled, attempts);
                }

                let wait = retry_delay(attempt_number, config.initial_retry_delay, retry_after);
                warn!(
                    label = %call.label,
                    attempt = attempt_number,
                    max_retries = config.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    hint_ms = retry_after.map(|d| d.as_millis() as u64),
                    "executor: rate limited, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return CallOutcome::terminal(call.label, CallError::BatchCancelled, attempts);
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(JudgeError::Failed(message)) => {
                warn!(label = %call.label, attempt = attempt_number, error = %message, "executor: call failed");
                attempts.push(CallAttempt {
                    attempt_number,
                    started_at,
                    finished_at,
                    outcome: AttemptOutcome::Failed(message.clone()),
                });
                return CallOutcome::terminal(call.label, CallError::Judge(message), attempts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_from_initial() {
        let initial = Duration::from_secs(2);
        assert_eq!(retry_delay(1, initial, None), Duration::from_secs(2));
        assert_eq!(retry_delay(2, initial, None), Duration::from_secs(4));
        assert_eq!(retry_delay(3, initial, None), Duration::from_secs(8));
        assert_eq!(retry_delay(5, initial, None), Duration::from_secs(32));
    }

    #[test]
    fn retry_delay_takes_larger_of_hint_and_backoff() {
        let initial = Duration::from_secs(2);
        assert_eq!(retry_delay(1, initial, Some(Duration::from_secs(30))), Duration::from_secs(30));
        assert_eq!(retry_delay(3, initial, Some(Duration::from_secs(1))), Duration::from_secs(8));
        assert_eq!(retry_delay(2, initial, Some(Duration::ZERO)), Duration::from_secs(4));
    }

    #[test]
    fn retry_delay_saturates() {
        let delay = retry_delay(200, Duration::from_secs(2), None);
        assert!(delay >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn config_from_rate_limit_section() {
        let section = common::RateLimitConfig {
            concurrency: Some(0),
            request_delay_seconds: Some(0.25),
            max_retries: Some(1),
            initial_retry_delay_seconds: None,
            call_timeout_seconds: Some(30),
        };
        let cfg = ExecutorConfig::from(&section);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.min_request_spacing, Duration::from_millis(250));
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.initial_retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(ExecutorConfig::default(), ExecutorConfig::from(&common::RateLimitConfig::default()));
    }

    #[tokio::test]
    async fn cancel_handle_is_sticky() {
        let cancel = CancelBatch::new();
        assert!(!cancel.is_cancelled());
        let clone = cancel.clone();
        clone.cancel();
        assert!(cancel.is_cancelled());
        // Resolves immediately once set
        cancel.cancelled().await;
    }
}
