//! Bounded exponential backoff for calls to flaky collaborators.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total wall-clock budget across all attempts and sleeps.
    pub max_elapsed: Duration,
}

impl Backoff {
    /// Policy for outbound email delivery.
    pub const fn email_delivery() -> Self {
        Self {
            initial_delay: Duration::from_millis(30),
            max_delay: Duration::from_millis(500),
            max_elapsed: Duration::from_secs(3),
        }
    }
}

/// Runs `operation` until it succeeds or the budget is spent.
///
/// The delay doubles after every failure up to `max_delay`, and each sleep is
/// jittered into the upper half of the current delay. No sleep is started
/// that would end past the budget; the last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: Backoff,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let pause = jitter_delay(delay);
                if started.elapsed() + pause > policy.max_elapsed {
                    warn!(attempt, "{what} failed, retry budget exhausted: {error}");
                    return Err(error);
                }

                warn!(attempt, ?pause, "{what} failed, backing off: {error}");
                sleep(pause).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
        }
    }
}

/// Picks a delay uniformly between half of `delay` and `delay`.
fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=delay_ms - half);
    Duration::from_millis(half + jitter)
}
