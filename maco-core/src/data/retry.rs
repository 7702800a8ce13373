//! Single-retry policy for provider calls.
//!
//! A rate-limit answer earns exactly one retry after a fixed backoff. Any
//! other failure, or a second rate limit, ends the call.

use std::time::Duration;
use tracing::debug;

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    RateLimited,
    Failed(String),
}

/// Fixed-backoff, one-retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Run `attempt` once, and once more only if the first answer was a rate
    /// limit. `attempt` receives the 1-based attempt number.
    pub fn run<T>(&self, mut attempt: impl FnMut(u32) -> Attempt<T>) -> Result<T, String> {
        match attempt(1) {
            Attempt::Done(value) => Ok(value),
            Attempt::Failed(reason) => Err(reason),
            Attempt::RateLimited => {
                debug!(backoff_ms = self.backoff.as_millis() as u64, "rate limited, retrying once");
                std::thread::sleep(self.backoff);
                match attempt(2) {
                    Attempt::Done(value) => Ok(value),
                    Attempt::Failed(reason) => Err(reason),
                    Attempt::RateLimited => Err("rate limited after retry".into()),
                }
            }
        }
    }
}
