//! Task dispatcher
//!
//! Process-wide gate in front of every worker call:
//!
//! - a FIFO pool of concurrency slots bounds how many calls run at once
//! - a token bucket bounds how often a call may start
//! - transient failures are retried with exponential backoff
//!
//! A call holds one [`DispatchSlot`] for the duration of one attempt. The slot
//! is released on drop, so every exit path (success, error, timeout, a
//! dropped future) gives it back.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::error::{OrchestratorError, Result};
use crate::worker::WorkerError;

/// One whole token in milli-token units
const MILLI: u64 = 1_000;

/// Upper bound on a single refill wait
const MAX_REFILL_WAIT_SECS: f64 = 3_600.0;

/// Refill rates above this are treated as unlimited
const MAX_RATE_PER_SEC: f64 = 1_000_000.0;

// ═══════════════════════════════════════════════════════════════════════════
// Token bucket
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct BucketState {
    /// Available tokens scaled by 1000 for sub-token refill precision
    tokens: u64,
    last_refill: Instant,
}

/// Rate limiter gating call starts
///
/// Starts full. Refill is computed lazily from elapsed time, capped at
/// capacity. Async waiters are served in arrival order.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Serializes async waiters so tokens go out in FIFO order
    queue: tokio::sync::Mutex<()>,
    rate: f64,
    capacity: u64,
}

/// NaN and negative rates mean no refill; infinite rates hit the ceiling.
fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        return 0.0;
    }
    rate.clamp(0.0, MAX_RATE_PER_SEC)
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = u64::from(capacity.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity * MILLI,
                last_refill: Instant::now(),
            }),
            queue: tokio::sync::Mutex::new(()),
            rate: clamp_rate(rate),
            capacity,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let add = (elapsed.as_secs_f64() * self.rate * MILLI as f64) as u64;
        if add > 0 {
            state.tokens = state.tokens.saturating_add(add).min(self.capacity * MILLI);
            state.last_refill = now;
        }
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens < MILLI {
            return false;
        }
        state.tokens -= MILLI;
        true
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens / MILLI
    }

    /// Wait for a token and take it
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= MILLI {
                    state.tokens -= MILLI;
                    return;
                }
                self.time_until_token(state.tokens)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn time_until_token(&self, tokens: u64) -> Duration {
        let deficit = (MILLI - tokens.min(MILLI)) as f64;
        let secs = if self.rate > 0.0 {
            deficit / (self.rate * MILLI as f64)
        } else {
            MAX_REFILL_WAIT_SECS
        };
        // Round up to the next millisecond so the refill after waking is non-zero
        let millis = (secs.min(MAX_REFILL_WAIT_SECS) * 1_000.0).ceil().max(1.0);
        Duration::from_millis(millis as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Attempts that acquired a slot and started
    pub started: u64,
    /// Calls that returned a value
    pub succeeded: u64,
    /// Calls that gave up (fatal, retries exhausted)
    pub failed: u64,
    /// Retries scheduled after a transient failure
    pub retried: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Slot
// ═══════════════════════════════════════════════════════════════════════════

/// One unit of concurrency capacity plus the rate token spent to start
///
/// Dropping the slot frees the concurrency unit; the token is restored by
/// refill over time.
pub struct DispatchSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl DispatchSlot {
    fn new(permit: OwnedSemaphorePermit, counters: Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        counters.started.fetch_add(1, Ordering::SeqCst);
        Self {
            _permit: permit,
            counters,
        }
    }
}

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════

/// Bounded-concurrency, rate-limited executor for worker calls
pub struct TaskDispatcher {
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    bucket: TokenBucket,
    counters: Arc<Counters>,
}

impl TaskDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let bucket = TokenBucket::new(config.rate_per_sec, config.bucket_capacity);
        Self {
            config,
            slots,
            bucket,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Free concurrency slots right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        DispatcherStats {
            started: c.started.load(Ordering::SeqCst),
            succeeded: c.succeeded.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            retried: c.retried.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Take a concurrency slot, then a rate token
    ///
    /// The slot is queued FIFO. Waiting for the token while holding the slot
    /// cannot deadlock: tokens come back with time, not with releases.
    pub async fn acquire_slot(&self) -> Result<DispatchSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::StageExecutionFailed("dispatcher closed".into()))?;
        self.bucket.acquire().await;
        Ok(DispatchSlot::new(permit, Arc::clone(&self.counters)))
    }

    /// Run `call` under the dispatcher's limits and retry policy
    pub async fn run<T, F, Fut>(&self, label: &str, call: F) -> std::result::Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkerError>>,
    {
        match self.run_cancellable(label, &CancellationToken::new(), call).await {
            Ok(value) => Ok(value),
            Err(OrchestratorError::Worker(e)) => Err(e),
            Err(other) => Err(WorkerError::fatal(other.to_string())),
        }
    }

    /// [`run`](Self::run) that gives up at its next suspension point once `cancel` fires
    ///
    /// Cancellation is observed while waiting for a slot and during backoff.
    /// An attempt already running is allowed to finish.
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkerError>>,
    {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let call_timeout = self.config.call_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::cancelled(format!("{} not started", label)));
                }
                slot = self.acquire_slot() => slot?,
            };

            let outcome = tokio::time::timeout(call_timeout, call()).await;
            drop(slot);

            let error = match outcome {
                Ok(Ok(value)) => {
                    self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                    debug!(label, attempt, "worker call succeeded");
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => WorkerError::transient(format!(
                    "call exceeded {}ms budget",
                    call_timeout.as_millis()
                )),
            };

            if !error.is_retryable() {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(label, attempt, error = %error, "worker call failed");
                return Err(error.into());
            }

            if attempt >= max_attempts {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(label, attempt, error = %error, "worker call gave up");
                return Err(WorkerError::fatal(format!(
                    "{} (gave up after {} attempts)",
                    error.cause(),
                    attempt
                ))
                .into());
            }

            let backoff = policy.backoff_for(attempt);
            self.counters.retried.fetch_add(1, Ordering::SeqCst);
            warn!(
                label,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "transient worker failure; retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::cancelled(format!(
                        "{} abandoned during backoff",
                        label
                    )));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
