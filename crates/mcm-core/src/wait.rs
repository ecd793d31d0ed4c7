use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{McmError, Result};

/// Total timeout and poll interval of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn from_secs(timeout_secs: u64, interval_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }
}

/// Poll `predicate` until it reports done, fails, or `wait.timeout` elapses.
///
/// `Ok(true)` finishes the wait, `Ok(false)` means "not yet", and an `Err` is
/// returned as-is. The predicate runs once right away, then every
/// `wait.interval`.
pub async fn wait_for<F, Fut>(label: &str, wait: WaitConfig, mut predicate: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + wait.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if predicate().await? {
            debug!(label, attempt, "wait condition met");
            return Ok(());
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(McmError::Timeout(format!(
                "{} not done within {}s",
                label,
                wait.timeout.as_secs()
            )));
        }

        debug!(label, attempt, "condition not met yet, polling again");
        let remaining = deadline - now;
        tokio::time::sleep(wait.interval.min(remaining)).await;
    }
}
