//! Runtime counters of a session.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared between a session and its scheduler task.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub ticks: Counter,
    /// Ticks taken before the path was resolved.
    pub idle_ticks: Counter,
    pub sends_posted: Counter,
    pub send_failures: Counter,
    pub send_completions: Counter,
    pub recv_completions: Counter,
    /// Receive completions with a non-success status.
    pub recv_errors: Counter,
    pub recv_reposts: Counter,
    /// Failed re-arms, polls and reposts.
    pub steady_state_failures: Counter,
    pub notifications: Counter,
    pub teardowns: Counter,
    pub teardown_failures: Counter,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.get(),
            idle_ticks: self.idle_ticks.get(),
            sends_posted: self.sends_posted.get(),
            send_failures: self.send_failures.get(),
            send_completions: self.send_completions.get(),
            recv_completions: self.recv_completions.get(),
            recv_errors: self.recv_errors.get(),
            recv_reposts: self.recv_reposts.get(),
            steady_state_failures: self.steady_state_failures.get(),
            notifications: self.notifications.get(),
            teardowns: self.teardowns.get(),
            teardown_failures: self.teardown_failures.get(),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub sends_posted: u64,
    pub send_failures: u64,
    pub send_completions: u64,
    pub recv_completions: u64,
    pub recv_errors: u64,
    pub recv_reposts: u64,
    pub steady_state_failures: u64,
    pub notifications: u64,
    pub teardowns: u64,
    pub teardown_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::default();
        c.increment();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_snapshot() {
        let stats = SessionStats::default();
        stats.ticks.add(3);
        stats.sends_posted.increment();
        stats.teardowns.increment();
        let snap = stats.snapshot();
        assert_eq!(snap.ticks, 3);
        assert_eq!(snap.sends_posted, 1);
        assert_eq!(snap.teardowns, 1);
        assert_eq!(snap.recv_completions, 0);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["ticks"], 3);
    }
}
