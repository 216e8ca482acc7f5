/// Fixed-delay retry shared by the embedding and chat clients.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Transport hiccups on the embedding service.
    pub const SHORT: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(10),
    };

    /// Rate limiting or overload reported by the language model service.
    pub const LONG: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_secs(10),
    };

    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts: attempts.max(1), delay }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, E, F, Fut, R>(&self, retryable: R, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && retryable(&e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
