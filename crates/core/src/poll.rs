use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// Fixed-interval retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const IP_ATTEMPTS: u32 = 60;
    pub const IP_INTERVAL: Duration = Duration::from_secs(2);
    /// Nested virtualization boots noticeably slower.
    pub const NESTED_FACTOR: u32 = 3;

    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Policy for waiting on a guest address.
    pub fn ip_discovery(nested: bool) -> Self {
        let attempts = if nested {
            Self::IP_ATTEMPTS * Self::NESTED_FACTOR
        } else {
            Self::IP_ATTEMPTS
        };
        Self::new(attempts, Self::IP_INTERVAL)
    }

    /// Runs `op` until it succeeds or the attempts run out, returning the
    /// last error unchanged.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt, attempts, "retrying: {e}");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.interval).await;
        }
    }
}
