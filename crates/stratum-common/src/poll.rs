//! Bounded polling with cancellation
//!
//! Every wait in the system (port reachability, reboot, node readiness, addon
//! readiness, etcd membership) has the same shape: probe, sleep, give up at a
//! deadline, and stop immediately when the caller cancels. This module is that
//! shape, parameterized by the probe and the interval strategy.
//!
//! # Example
//!
//! ```ignore
//! use stratum_common::poll::{poll_until, IntervalStrategy, PollOutcome};
//!
//! let addr = poll_until(
//!     &cancel,
//!     "maintenance-port",
//!     "10.0.1.11:50000",
//!     Duration::from_secs(600),
//!     &IntervalStrategy::fixed(Duration::from_secs(5)),
//!     || async {
//!         if probe.is_open(addr).await {
//!             Ok(PollOutcome::Ready(addr))
//!         } else {
//!             Ok(PollOutcome::Pending("connection refused".into()))
//!         }
//!     },
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::Error;

/// Result of one probe
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// Condition met
    Ready(T),
    /// Not yet; the text describes what was observed and ends up in the timeout error
    Pending(String),
}

/// How long to sleep between probes
#[derive(Clone, Debug, PartialEq)]
pub enum IntervalStrategy {
    /// Same delay every time
    Fixed(Duration),
    /// Delay grows by `multiplier` up to `max`, with 0.5x-1.5x jitter when enabled
    Exponential {
        /// First delay
        initial: Duration,
        /// Upper bound on any single delay
        max: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Randomize each delay to avoid lockstep probing
        jitter: bool,
    },
}

impl IntervalStrategy {
    /// Fixed interval
    pub fn fixed(interval: Duration) -> Self {
        IntervalStrategy::Fixed(interval)
    }

    /// Exponential backoff doubling from `initial` up to `max`, jittered
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        IntervalStrategy::Exponential {
            initial,
            max,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay before probe number `attempt + 1` (0-based attempt)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            IntervalStrategy::Fixed(d) => *d,
            IntervalStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let base = (initial.as_secs_f64() * multiplier.powi(attempt as i32))
                    .min(max.as_secs_f64());
                let factor = if *jitter {
                    rand::thread_rng().gen_range(0.5..1.5)
                } else {
                    1.0
                };
                Duration::from_secs_f64((base * factor).min(max.as_secs_f64()))
            }
        }
    }
}

impl Default for IntervalStrategy {
    fn default() -> Self {
        IntervalStrategy::fixed(Duration::from_secs(5))
    }
}

/// Poll until the probe reports ready, the deadline passes, or `cancel` fires.
///
/// Probe errors that are retryable are treated like a pending result and
/// polled through; non-retryable errors end the wait immediately. On timeout
/// the error carries the last observed state.
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    step: &str,
    target: &str,
    timeout: Duration,
    interval: &IntervalStrategy,
    mut probe: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>, Error>>,
{
    let deadline = Instant::now() + timeout;
    let mut last_state = String::from("no probe completed");
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(step));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(step)),
            outcome = probe() => outcome,
        };

        match outcome {
            Ok(PollOutcome::Ready(value)) => {
                debug!(step, target, attempts = attempt + 1, "wait condition met");
                return Ok(value);
            }
            Ok(PollOutcome::Pending(state)) => {
                trace!(step, target, state = %state, "wait condition not met yet");
                last_state = state;
            }
            Err(e) if e.is_retryable() => {
                trace!(step, target, error = %e, "probe failed, retrying");
                last_state = e.to_string();
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(step, target, last_state));
        }

        let delay = interval.delay(attempt).min(deadline - now);
        attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(step)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run a single future, aborting with [`Error::Cancelled`] when `cancel` fires
pub async fn run_cancellable<T, Fut>(
    cancel: &CancellationToken,
    step: &str,
    fut: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    if cancel.is_cancelled() {
        return Err(Error::cancelled(step));
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(step)),
        result = fut => result,
    }
}
