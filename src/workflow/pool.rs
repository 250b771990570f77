//! Bounded worker pool and polling/retry helpers shared by the phase
//! engines.
//!
//! The pool is the single place that enforces a phase's admission limit:
//! one tokio task per item, gated by a semaphore sized to `max_concurrent`.
//! Completed outcomes land in a mutex-guarded append-only vector, so the
//! accumulator is never read-modified by concurrent writers. An optional
//! phase deadline aborts stragglers; items with no recorded outcome get a
//! synthesized one, which keeps the output set exactly as large as the
//! input set even under cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::gateways::GatewayError;
use crate::RetryPolicy;

pub(crate) type BoxedWork<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Run `work` over every item with at most `max_concurrent` in flight.
///
/// Returns exactly one outcome per input item, in input order. Items whose
/// worker was cut off by the phase deadline (or died) are filled in via
/// `synthesize_missing`.
pub(crate) async fn run_bounded<I, T, W, S>(
    items: Vec<I>,
    max_concurrent: usize,
    phase_timeout: Option<Duration>,
    work: W,
    synthesize_missing: S,
) -> Vec<T>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    W: Fn(I) -> BoxedWork<T> + Send + Sync + 'static,
    S: Fn(&I) -> T,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let slots: Arc<Mutex<Vec<(usize, T)>>> = Arc::new(Mutex::new(Vec::with_capacity(items.len())));
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(items.len());
    for (index, item) in items.iter().cloned().enumerate() {
        let semaphore = semaphore.clone();
        let slots = slots.clone();
        let work = work.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore closed");
            let outcome = work(item).await;
            slots.lock().await.push((index, outcome));
        }));
    }

    let join_all = async {
        for joined in futures::future::join_all(handles.iter_mut()).await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    warn!(error = %err, "pool worker died; outcome will be synthesized");
                }
            }
        }
    };
    match phase_timeout {
        Some(limit) => {
            if tokio::time::timeout(limit, join_all).await.is_err() {
                warn!(limit_ms = limit.as_millis() as u64, "phase deadline elapsed; aborting outstanding workers");
                for handle in &handles {
                    handle.abort();
                }
            }
        }
        None => join_all.await,
    }

    let mut recorded: Vec<Option<T>> = (0..items.len()).map(|_| None).collect();
    for (index, outcome) in slots.lock().await.drain(..) {
        recorded[index] = Some(outcome);
    }
    recorded
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| outcome.unwrap_or_else(|| synthesize_missing(&items[index])))
        .collect()
}

/// Poll `probe` at `interval` until it yields a value or `deadline` passes.
///
/// The probe decides what counts as settled by returning `Some`; `None`
/// keeps polling. Returns `None` on deadline expiry.
pub(crate) async fn poll_until<T, F, Fut>(deadline: Instant, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Why a retried operation ultimately did not succeed.
pub(crate) struct RetryFailure {
    pub error: Option<GatewayError>,
    /// Retries consumed before giving up.
    pub retries: u32,
    /// True when the deadline cut the retry loop short rather than the
    /// error being permanent or attempts running out.
    pub timed_out: bool,
}

/// Run `op`, retrying transient failures per `policy`.
///
/// Permanent errors fail immediately. On success returns the value and the
/// number of retries consumed. `deadline` (and `policy.timeout`, if set)
/// bound the total time including backoff sleeps.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let policy_deadline = policy.timeout.map(|t| Instant::now() + t);
    let deadline = match (deadline, policy_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt - 1)),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                if let Some(limit) = deadline {
                    if Instant::now() + delay >= limit {
                        return Err(RetryFailure {
                            error: Some(err),
                            retries: attempt - 1,
                            timed_out: true,
                        });
                    }
                }
                warn!(attempt, error = %err, "transient gateway error; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(RetryFailure {
                    error: Some(err),
                    retries: attempt - 1,
                    timed_out: false,
                })
            }
        }
    }
}
