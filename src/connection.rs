//! Connection state machine with hysteresis: three consecutive failures trip
//! to offline, a single success restores online.

use parking_lot::Mutex;

const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Online,
    Offline,
}

/// Point-in-time view of the connection state, for logging/monitoring.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSnapshot {
    pub state: ConnState,
    pub consecutive_failures: u32,
}

struct Inner {
    state: ConnState,
    consecutive_failures: u32,
}

/// Thread-safe online/offline tracker. Cheap to read; all mutation is
/// serialized under a single `parking_lot::Mutex`.
pub struct ConnectionState {
    inner: Mutex<Inner>,
}

impl ConnectionState {
    pub fn new() -> Self {
        ConnectionState {
            inner: Mutex::new(Inner {
                state: ConnState::Online,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn offline() -> Self {
        ConnectionState {
            inner: Mutex::new(Inner {
                state: ConnState::Offline,
                consecutive_failures: FAILURE_THRESHOLD,
            }),
        }
    }

    /// Record a successful send. Any success restores Online immediately.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let was_offline = inner.state == ConnState::Offline;
        inner.consecutive_failures = 0;
        inner.state = ConnState::Online;
        if was_offline {
            tracing::info!("connection restored, resuming online mode");
        }
    }

    /// Record a failed send. Three consecutive failures trip to Offline.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= FAILURE_THRESHOLD && inner.state == ConnState::Online {
            inner.state = ConnState::Offline;
            tracing::info!(
                consecutive_failures = inner.consecutive_failures,
                "connection marked offline after repeated failures"
            );
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().state == ConnState::Online
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        ConnectionSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_online() {
        let conn = ConnectionState::new();
        assert!(conn.is_online());
    }

    #[test]
    fn three_consecutive_failures_trip_offline() {
        let conn = ConnectionState::new();
        conn.record_failure();
        conn.record_failure();
        assert!(conn.is_online());
        conn.record_failure();
        assert!(!conn.is_online());
    }

    #[test]
    fn single_success_restores_online_and_resets_failures() {
        let conn = ConnectionState::new();
        conn.record_failure();
        conn.record_failure();
        conn.record_failure();
        assert!(!conn.is_online());
        conn.record_success();
        assert!(conn.is_online());
        assert_eq!(conn.consecutive_failures(), 0);
    }

    #[test]
    fn interleaved_successes_never_trip_offline() {
        let conn = ConnectionState::new();
        for _ in 0..10 {
            conn.record_failure();
            conn.record_failure();
            conn.record_success();
        }
        assert!(conn.is_online());
    }
}
