//! In-process proxy counters.
//!
//! Plain counters the engine bumps as it works. There is no reporting
//! surface; tests and embedders read a [`snapshot`](ProxyStats::snapshot).

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub clients_accepted: u64,
    pub requests_forwarded: u64,
    pub responses_relayed: u64,
    pub requests_dropped_no_backend: u64,
    pub requests_dropped_connect_failed: u64,
    pub requests_dropped_send_failed: u64,
    pub connections_dropped_protocol: u64,
}

/// Mutable counter set owned by the engine.
#[derive(Debug, Default)]
pub struct ProxyStats {
    inner: StatsSnapshot,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
    }

    pub fn client_accepted(&mut self) {
        self.inner.clients_accepted += 1;
    }

    pub fn request_forwarded(&mut self) {
        self.inner.requests_forwarded += 1;
    }

    pub fn response_relayed(&mut self) {
        self.inner.responses_relayed += 1;
    }

    pub fn dropped_no_backend(&mut self) {
        self.inner.requests_dropped_no_backend += 1;
    }

    pub fn dropped_connect_failed(&mut self) {
        self.inner.requests_dropped_connect_failed += 1;
    }

    pub fn dropped_send_failed(&mut self) {
        self.inner.requests_dropped_send_failed += 1;
    }

    pub fn dropped_protocol(&mut self) {
        self.inner.connections_dropped_protocol += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut stats = ProxyStats::new();
        stats.client_accepted();
        stats.request_forwarded();
        stats.request_forwarded();
        stats.response_relayed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.clients_accepted, 1);
        assert_eq!(snapshot.requests_forwarded, 2);
        assert_eq!(snapshot.responses_relayed, 1);
        assert_eq!(snapshot.requests_dropped_no_backend, 0);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut stats = ProxyStats::new();
        let before = stats.snapshot();
        stats.client_accepted();
        assert_eq!(before.clients_accepted, 0);
        assert_eq!(stats.snapshot().clients_accepted, 1);
    }
}
