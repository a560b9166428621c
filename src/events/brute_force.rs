//! Refuse channel registrations from senders that keep failing
//! authentication.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BruteForceGuard {
    window: Duration,
    max_attempts: usize,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl BruteForceGuard {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts: max_attempts as usize,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(first) = attempts.front() {
            if now.duration_since(*first) >= self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if `sender` reached the limit inside the window.
    pub fn is_blocked(&self, sender: &str) -> bool {
        if self.max_attempts == 0 {
            return false;
        }
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        let key = sender.to_ascii_lowercase();
        let now = Instant::now();
        let blocked = match failures.get_mut(&key) {
            Some(attempts) => {
                self.prune(attempts, now);
                attempts.len() >= self.max_attempts
            }
            None => false,
        };
        if blocked {
            tracing::warn!(sender = %key, "Brute force attack suspected, registration refused");
        }
        blocked
    }

    pub fn record_failure(&self, sender: &str) {
        let Ok(mut failures) = self.failures.lock() else {
            return;
        };
        let now = Instant::now();
        let attempts = failures.entry(sender.to_ascii_lowercase()).or_default();
        self.prune(attempts, now);
        attempts.push_back(now);
    }

    /// Drop senders whose failures all left the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        if let Ok(mut failures) = self.failures.lock() {
            failures.retain(|_, attempts| {
                self.prune(attempts, now);
                !attempts.is_empty()
            });
        }
    }

    pub fn tracked(&self) -> usize {
        self.failures.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_after_max_attempts() {
        let guard = BruteForceGuard::new(Duration::from_secs(60), 3);
        for _ in 0..2 {
            guard.record_failure("10.0.0.9");
        }
        assert!(!guard.is_blocked("10.0.0.9"));
        guard.record_failure("10.0.0.9");
        assert!(guard.is_blocked("10.0.0.9"));
        assert!(!guard.is_blocked("10.0.0.10"));
    }

    #[test]
    fn test_window_expiry() {
        let guard = BruteForceGuard::new(Duration::from_millis(0), 1);
        guard.record_failure("host");
        assert!(!guard.is_blocked("host"));
        guard.sweep();
        assert_eq!(guard.tracked(), 0);
    }

    #[test]
    fn test_zero_attempts_disables_guard() {
        let guard = BruteForceGuard::new(Duration::from_secs(60), 0);
        guard.record_failure("host");
        assert!(!guard.is_blocked("host"));
    }
}
