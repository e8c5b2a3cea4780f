//! Cross-process mutual exclusion over the schema history table.
//!
//! The lock is the single correctness-critical concurrency guarantee of
//! the engine: at most one holder per schema per database cluster may be
//! inside the reconcile-and-execute critical section.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{MigrateError, MigrateResult};

/// Delay schedule between lock acquisition attempts.
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    /// Constant delay between attempts.
    Fixed(Duration),
    /// Delay doubles each attempt, starting at `base`, capped at `cap`.
    Exponential {
        /// First delay.
        base: Duration,
        /// Upper bound on the delay.
        cap: Duration,
    },
}

impl RetryPolicy {
    /// The delay to sleep after the given failed attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(cap, |d| d.min(cap))
            }
        }
    }
}

/// Advisory-lock backend.
///
/// Implementations typically issue a database-native advisory lock
/// statement or take a sentinel row with `SELECT ... FOR UPDATE`.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Attempt to take the lock without blocking. Returns `false` when
    /// another holder has it.
    async fn try_acquire(&self) -> MigrateResult<bool>;

    /// Release the lock.
    async fn release(&self) -> MigrateResult<()>;

    /// Delay schedule between attempts.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Fixed(Duration::from_secs(1))
    }
}

/// Retries lock acquisition within the configured budget.
pub struct LockCoordinator;

impl LockCoordinator {
    /// Acquire the lock, retrying `retry_count` times (`-1` retries
    /// indefinitely) with the provider's delay schedule.
    ///
    /// The returned guard must be released via [`LockGuard::release`];
    /// dropping it without releasing triggers a best-effort background
    /// release so a cancelled run does not leave the lock held.
    pub async fn acquire(
        provider: Arc<dyn LockProvider>,
        retry_count: i32,
    ) -> MigrateResult<LockGuard> {
        let policy = provider.retry_policy();
        let mut attempt: u32 = 0;

        loop {
            if provider.try_acquire().await? {
                debug!(attempt, "migration lock acquired");
                return Ok(LockGuard {
                    provider,
                    released: false,
                });
            }

            let budget_left = retry_count < 0 || (attempt as i64) < retry_count as i64;
            if !budget_left {
                return Err(MigrateError::lock_acquisition(format!(
                    "gave up after {} attempt(s); another migration run holds the lock",
                    attempt + 1
                )));
            }

            let delay = policy.delay(attempt);
            debug!(attempt, ?delay, "migration lock busy, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Scoped handle to a held lock.
pub struct LockGuard {
    provider: Arc<dyn LockProvider>,
    released: bool,
}

impl LockGuard {
    /// Release the lock.
    pub async fn release(mut self) -> MigrateResult<()> {
        self.released = true;
        self.provider.release().await
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("migration lock guard dropped without release; releasing in background");
        let provider = Arc::clone(&self.provider);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = provider.release().await {
                    warn!(%err, "background lock release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyLock {
        free_after: AtomicU32,
        held: Mutex<bool>,
    }

    impl FlakyLock {
        fn busy_for(attempts: u32) -> Self {
            Self {
                free_after: AtomicU32::new(attempts),
                held: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl LockProvider for FlakyLock {
        async fn try_acquire(&self) -> MigrateResult<bool> {
            if self.free_after.load(Ordering::SeqCst) > 0 {
                self.free_after.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            let mut held = self.held.lock().unwrap();
            if *held {
                return Ok(false);
            }
            *held = true;
            Ok(true)
        }

        async fn release(&self) -> MigrateResult<()> {
            *self.held.lock().unwrap() = false;
            Ok(())
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::Fixed(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    async fn test_acquires_after_contention() {
        let lock = Arc::new(FlakyLock::busy_for(3));
        let guard = LockCoordinator::acquire(lock.clone(), 5).await.unwrap();
        assert!(format!("{guard:?}").contains("LockGuard"));
        guard.release().await.unwrap();
        assert!(!*lock.held.lock().unwrap());
    }

    #[tokio::test]
    async fn test_fails_when_budget_exhausted() {
        let lock = Arc::new(FlakyLock::busy_for(10));
        let err = LockCoordinator::acquire(lock, 2).await.unwrap_err();
        assert!(matches!(err, MigrateError::LockAcquisition(_)));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let lock = Arc::new(FlakyLock::busy_for(1));
        assert!(LockCoordinator::acquire(lock, 0).await.is_err());
    }

    #[test]
    fn test_exponential_policy_caps() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_secs(2));
        assert_eq!(policy.delay(63), Duration::from_secs(2));
    }
}
