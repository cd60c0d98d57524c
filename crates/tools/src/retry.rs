//! Retry-with-partial-aggregation.
//!
//! Runs one independent retrying task per input with bounded concurrency and
//! returns one outcome per input, in input order. A task that exhausts its
//! attempts records its last error; it never cancels its siblings.

use std::future::Future;
use std::time::Duration;

use deepsearch_core::error::RetrievalError;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// How often and how patiently a single task is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled before each later one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

/// The result of one retrying task.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub outcome: Result<T, RetrievalError>,
    /// Attempts actually started
    pub attempts: u32,
}

/// Run `op` for every input, retrying each sequentially per `policy`, with
/// at most `concurrency` inputs in flight. Outcomes come back in input order
/// regardless of completion order.
///
/// When `cancel` fires, outstanding tasks stop at their next await point and
/// report [`RetrievalError::Cancelled`]; finished tasks keep their outcome.
pub async fn retry_all<I, T, F, Fut>(
    inputs: Vec<I>,
    concurrency: usize,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Vec<Attempted<T>>
where
    F: Fn(I) -> Fut,
    I: Clone,
    Fut: Future<Output = Result<T, RetrievalError>>,
{
    // Unordered so a slot frees as soon as any task finishes; outcomes are
    // written back by index.
    let mut slots: Vec<Option<Attempted<T>>> = Vec::with_capacity(inputs.len());
    slots.resize_with(inputs.len(), || None);

    let mut finished = futures::stream::iter(inputs.into_iter().enumerate())
        .map(|(index, input)| {
            let op = &op;
            async move { (index, retry_one(input, policy, cancel, op).await) }
        })
        .buffer_unordered(concurrency.max(1));

    while let Some((index, attempted)) = finished.next().await {
        slots[index] = Some(attempted);
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or(Attempted {
                outcome: Err(RetrievalError::Cancelled),
                attempts: 0,
            })
        })
        .collect()
}

async fn retry_one<I, T, F, Fut>(
    input: I,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: &F,
) -> Attempted<T>
where
    F: Fn(I) -> Fut,
    I: Clone,
    Fut: Future<Output = Result<T, RetrievalError>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return Attempted { outcome: Err(RetrievalError::Cancelled), attempts };
        }
        attempts += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
            result = op(input.clone()) => result,
        };

        let err = match result {
            Ok(value) => return Attempted { outcome: Ok(value), attempts },
            Err(RetrievalError::Cancelled) => {
                return Attempted { outcome: Err(RetrievalError::Cancelled), attempts };
            }
            Err(e) => e,
        };

        if attempts >= policy.max_attempts {
            return Attempted { outcome: Err(err), attempts };
        }

        tracing::debug!(attempt = attempts, error = %err, "Retrying after failure");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Attempted { outcome: Err(RetrievalError::Cancelled), attempts };
            }
            _ = tokio::time::sleep(policy.delay_after(attempts)) => {}
        }
    }
}
