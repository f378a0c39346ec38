//! Frame-production watchdog
//!
//! The acquisition thread calls [`Watchdog::heartbeat`] after every valid
//! frame. The watchdog is considered expired when no heartbeat arrived
//! within its timeout.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// A valid frame was produced within the deadline.
    Healthy,
    /// No valid frame within the deadline.
    TimedOut,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

pub struct Watchdog {
    last_heartbeat: Mutex<Instant>,
    timeout: Mutex<Duration>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_heartbeat: Mutex::new(Instant::now()),
            timeout: Mutex::new(timeout),
        }
    }

    /// Reset the deadline with a new timeout, starting healthy
    pub fn arm(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
        self.heartbeat();
    }

    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    pub fn health(&self) -> ComponentHealth {
        if self.since_last_heartbeat() <= self.timeout() {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::TimedOut
        }
    }

    pub fn expired(&self) -> bool {
        self.health() == ComponentHealth::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // ── Deadlines ──────────────────────────────────────────────────────────

    #[test]
    fn fresh_watchdog_is_healthy() {
        let wd = Watchdog::new(Duration::from_secs(5));
        assert_eq!(wd.health(), ComponentHealth::Healthy);
    }

    #[test]
    fn heartbeat_resets_deadline() {
        let wd = Watchdog::new(Duration::from_millis(40));
        thread::sleep(Duration::from_millis(25));
        wd.heartbeat();
        thread::sleep(Duration::from_millis(25));
        assert!(!wd.expired());
    }

    #[test]
    fn silence_expires() {
        let wd = Watchdog::new(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(wd.health(), ComponentHealth::TimedOut);
    }

    // ── Re-arming ──────────────────────────────────────────────────────────

    #[test]
    fn arm_replaces_timeout_and_restarts() {
        let wd = Watchdog::new(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(20));
        assert!(wd.expired());

        wd.arm(Duration::from_secs(5));
        assert!(!wd.expired());
        assert_eq!(wd.timeout(), Duration::from_secs(5));
    }
}
