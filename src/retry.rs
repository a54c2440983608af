use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;

/// Bounded exponential backoff.
///
/// An operation governed by a policy is attempted at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds or `policy` is exhausted, sleeping with backoff between
/// attempts. `op` receives the 1-based attempt number. An integrity failure is always
/// retried at least once, even when it lands on the last budgeted attempt. Returns the last
/// error on exhaustion.
pub fn run_with_retry<T>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    what: &str,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    let mut integrity_retried = false;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                let integrity_retry = e.is_integrity() && !integrity_retried;
                if e.is_integrity() {
                    integrity_retried = true;
                }
                if attempt >= policy.max_attempts() && !integrity_retry {
                    warn!("{what}: giving up after {attempt} attempt(s): {e}");
                    return Err(e);
                }
                let delay = policy.backoff(attempt);
                warn!("{what}: attempt {attempt} failed ({e}), retrying in {delay:?}");
                clock.sleep(delay);
            }
        }
    }
}

/// Time source and sleeper. Injected so polling and backoff loops can be driven
/// without real delays.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Clock whose `sleep` only advances its own notion of time.
    pub(crate) struct ManualClock {
        now: Mutex<DateTime<Utc>>,
        pub(crate) sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub(crate) fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn total_slept(&self) -> Duration {
            self.sleeps.lock().unwrap().iter().sum()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, d: Duration) {
            self.sleeps.lock().unwrap().push(d);
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(d).unwrap();
        }
    }
}
