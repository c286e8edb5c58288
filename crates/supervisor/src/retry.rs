use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {rand::Rng, tokio::task::JoinHandle};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backoff tuning for session reopen attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: pylon_common::MAX_RETRIES,
            base: Duration::from_millis(pylon_common::RETRY_BASE_MS),
            cap: Duration::from_millis(pylon_common::RETRY_CAP_MS),
            jitter: Duration::from_millis(pylon_common::RETRY_JITTER_MS),
        }
    }
}

/// Per-instance bounded backoff with at most one pending timer per id.
///
/// The scheduler only tracks counters and timers; the supervisor owns the
/// actual reopen task and registers its `JoinHandle` here so a newer
/// schedule (or a teardown) can cancel it.
pub(crate) struct RetryScheduler {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<String, u32>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Count one more attempt. Returns `(attempt, delay)` for the next
    /// reopen, or `None` once the ceiling is exceeded — the caller then
    /// marks the instance failed and stops.
    pub fn next_attempt(&self, instance_id: &str) -> Option<(u32, Duration)> {
        let mut attempts = lock(&self.attempts);
        let n = attempts.entry(instance_id.to_string()).or_insert(0);
        *n += 1;
        let attempt = *n;
        if attempt > self.policy.max_retries {
            attempts.remove(instance_id);
            return None;
        }
        Some((attempt, self.delay_for(attempt)))
    }

    /// `min(cap, 2^attempt * base) + uniform(0, jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.base.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = exp_ms.min(self.policy.cap.as_millis() as u64);
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        Duration::from_millis(capped + jitter)
    }

    /// Register the pending reopen timer, cancelling any prior one.
    pub fn set_timer(&self, instance_id: &str, timer: JoinHandle<()>) {
        if let Some(old) = lock(&self.timers).insert(instance_id.to_string(), timer) {
            old.abort();
        }
    }

    /// Called by the timer task itself once it fires, so a later
    /// `set_timer` doesn't abort an already-running reopen.
    pub fn timer_fired(&self, instance_id: &str) {
        lock(&self.timers).remove(instance_id);
    }

    /// Forget the instance entirely: counter plus any pending timer.
    pub fn clear(&self, instance_id: &str) {
        lock(&self.attempts).remove(instance_id);
        if let Some(timer) = lock(&self.timers).remove(instance_id) {
            timer.abort();
        }
    }

    pub fn attempts(&self, instance_id: &str) -> u32 {
        lock(&self.attempts).get(instance_id).copied().unwrap_or(0)
    }

    pub fn has_pending_timer(&self, instance_id: &str) -> bool {
        lock(&self.timers)
            .get(instance_id)
            .is_some_and(|t| !t.is_finished())
    }
}
