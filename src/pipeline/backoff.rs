//! Bounded exponential retry for the output boundary

use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before retry number `attempt` (zero-based), capped at the maximum
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.delay_for(self.current_attempt);
        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = ExponentialBackoff::new(100, 5_000, 10);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(3_200));
        assert_eq!(backoff.delay_for(6), Duration::from_millis(5_000));
        assert_eq!(backoff.delay_for(80), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut backoff = ExponentialBackoff::new(1, 2, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert_eq!(backoff.sleep().await, Err(MaxRetriesExceeded));
        assert_eq!(backoff.attempts(), 2);
    }
}
