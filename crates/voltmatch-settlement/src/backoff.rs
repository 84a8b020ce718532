//! Bounded exponential backoff for ledger calls.
//!
//! Only [`LedgerError::Unavailable`] is retried. A rejection ends the loop at
//! once; running out of attempts yields [`VoltmatchError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use voltmatch_types::{BackoffConfig, Result, TradeId, VoltmatchError};

use crate::adapter::{LedgerError, LedgerResult};

/// Retry schedule: `initial × multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    multiplier: u32,
    max_delay: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(initial_delay: Duration, multiplier: u32, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            multiplier: multiplier.max(1),
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// No waiting between attempts. Used by tests and by callers that
    /// schedule their own retries.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, 1, Duration::ZERO, max_attempts)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `call` until it succeeds, is rejected, or the attempt budget is
    /// spent.
    pub async fn run<T, F, Fut>(&self, trade_id: TradeId, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Rejected(reason)) => {
                    warn!(trade = %trade_id, operation, %reason, "ledger rejected call");
                    return Err(VoltmatchError::LedgerRejected { trade_id, reason });
                }
                Err(LedgerError::Unavailable(reason)) => {
                    if attempt >= self.max_attempts {
                        warn!(trade = %trade_id, operation, attempts = attempt, %reason, "ledger retries exhausted");
                        return Err(VoltmatchError::RetriesExhausted {
                            trade_id,
                            attempts: attempt,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        trade = %trade_id,
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %reason,
                        "ledger unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.multiplier,
            config.max_delay(),
            config.max_attempts,
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2, Duration::from_millis(500), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn defaults_follow_config() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = BackoffPolicy::immediate(5);
        let result = policy
            .run(TradeId::new(), "lock", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = BackoffPolicy::immediate(3);
        let err = policy
            .run(TradeId::new(), "settle", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::Unavailable("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VoltmatchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = BackoffPolicy::immediate(5);
        let err = policy
            .run(TradeId::new(), "lock", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::Rejected("insufficient funds".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VoltmatchError::LedgerRejected { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
