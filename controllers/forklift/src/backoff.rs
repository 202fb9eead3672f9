//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations. The sequence grows more slowly than an
//! exponential one, so a flapping dependency (inventory restart, API throttling) is retried
//! often at first without hammering it later.
//!
//! Sequence with the default bounds: 5s, 5s, 10s, 15s, 25s, 40s, 65s ... capped at 300s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consecutive failures of one object before the error is surfaced at `error` level
pub const BACKOFF_SURFACE_THRESHOLD: u32 = 5;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the two previous delays, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_seconds` and capped at `max_seconds`
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next delay in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;
        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);
        result
    }

    /// Get the next delay as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requeue {
    /// Delay before the next attempt
    pub delay: Duration,
    /// Consecutive failures including this one
    pub error_count: u32,
}

impl Requeue {
    /// True once the object failed often enough in a row to be reported
    pub fn should_surface(&self) -> bool {
        self.error_count >= BACKOFF_SURFACE_THRESHOLD
    }
}

/// Per-object backoff state keyed by `kind/namespace/name`
#[derive(Debug, Clone)]
pub struct BackoffTable {
    min_seconds: u64,
    max_seconds: u64,
    states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl BackoffTable {
    /// Create an empty table
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            max_seconds,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a failure and get the delay before retrying
    pub fn record_failure(&self, key: &str) -> Requeue {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            backoff: FibonacciBackoff::new(self.min_seconds, self.max_seconds),
            error_count: 0,
        });
        state.error_count += 1;
        Requeue {
            delay: state.backoff.next_backoff(),
            error_count: state.error_count,
        }
    }

    /// Forget the failures of an object after a successful reconcile
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(key) {
            state.error_count = 0;
            state.backoff.reset();
        }
    }

    /// Consecutive failures recorded for an object
    pub fn error_count(&self, key: &str) -> u32 {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(key).map_or(0, |s| s.error_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        let sequence: Vec<u64> = (0..8).map(|_| backoff.next_backoff_seconds()).collect();
        assert_eq!(sequence, vec![5, 5, 10, 15, 25, 40, 65, 105]);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        for _ in 0..20 {
            backoff.next_backoff_seconds();
        }
        assert_eq!(backoff.next_backoff_seconds(), 300);
        assert_eq!(backoff.next_backoff_seconds(), 300);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(5, 300);
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.reset();
        assert_eq!(backoff.next_backoff_seconds(), 5);
        assert_eq!(backoff.next_backoff_seconds(), 5);
        assert_eq!(backoff.next_backoff_seconds(), 10);
    }

    #[test]
    fn test_table_surfaces_after_threshold() {
        let table = BackoffTable::new(5, 300);
        for attempt in 1..BACKOFF_SURFACE_THRESHOLD {
            let requeue = table.record_failure("Plan/ns/p1");
            assert_eq!(requeue.error_count, attempt);
            assert!(!requeue.should_surface());
        }
        let requeue = table.record_failure("Plan/ns/p1");
        assert!(requeue.should_surface());
        assert_eq!(requeue.delay, Duration::from_secs(25));

        // Other objects are unaffected
        assert_eq!(table.record_failure("Plan/ns/p2").error_count, 1);

        table.reset("Plan/ns/p1");
        assert_eq!(table.error_count("Plan/ns/p1"), 0);
        assert_eq!(table.record_failure("Plan/ns/p1").delay, Duration::from_secs(5));
    }
}
