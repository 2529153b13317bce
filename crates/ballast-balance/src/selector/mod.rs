//! The selector contract and its six implementations.
//!
//! A selector answers one question per request (*which backend*) and is
//! kept honest by lifecycle notifications from the proxy. All algorithms
//! speak the same five-method contract; the proxy holds a tagged
//! [`AnySelector`] so per-request dispatch stays a plain `match` rather
//! than a virtual call.
//!
//! # Contract
//!
//! - `on_membership_change` runs after every registry mutation; selectors
//!   rebuild whatever internal tables they keep (WRR weights, hash rings,
//!   Maglev lookup tables, EWMA maps).
//! - `choose` must not mutate the registry and must never return a backend
//!   whose weight is zero, except where an algorithm documents otherwise
//!   (Random ignores weights entirely).
//! - `notify_sent` / `notify_finished` bracket every request exactly once
//!   across all outcomes; only least-request and peak-EWMA act on them.
//! - `record_latency` feeds RTT observations; only peak-EWMA acts on it.

pub mod least_request;
pub mod maglev;
pub mod peak_ewma;
pub mod random;
pub mod ring_hash;
pub mod round_robin;

use std::net::SocketAddr;

use ballast_common::ProxyConfig;

use crate::registry::BackendInfo;

pub use least_request::LeastRequest;
pub use maglev::Maglev;
pub use peak_ewma::PeakEwma;
pub use random::Random;
pub use ring_hash::RingHash;
pub use round_robin::WeightedRoundRobin;

/// Backend-selection strategy driven by the proxy.
pub trait Selector {
    /// Called after the registry changed; rebuild internal tables.
    fn on_membership_change(&mut self, backends: &[BackendInfo]);

    /// Picks a backend for a request, or `None` when no backend is
    /// selectable (empty registry, or no positive weight where required).
    fn choose(
        &mut self,
        l7_id: u64,
        backends: &[BackendInfo],
        now_ns: i64,
    ) -> Option<SocketAddr>;

    /// Observes a request/response round-trip time against `address`.
    fn record_latency(&mut self, address: SocketAddr, rtt_ns: i64, now_ns: i64) {
        let _ = (address, rtt_ns, now_ns);
    }

    /// A request was sent (or queued for a connecting socket) to `address`.
    fn notify_sent(&mut self, address: SocketAddr) {
        let _ = address;
    }

    /// A request against `address` finished, successfully or not.
    fn notify_finished(&mut self, address: SocketAddr) {
        let _ = address;
    }
}

/// The tagged union of all selectors, dispatched statically.
pub enum AnySelector {
    WeightedRoundRobin(WeightedRoundRobin),
    LeastRequest(LeastRequest),
    Random(Random),
    RingHash(RingHash),
    Maglev(Maglev),
    PeakEwma(PeakEwma),
}

impl AnySelector {
    /// Builds the selector named by the configuration, seeding every
    /// randomized algorithm from the listener seed.
    pub fn from_config(config: &ProxyConfig) -> AnySelector {
        use ballast_common::Algorithm;
        match config.algorithm {
            Algorithm::WeightedRoundRobin => {
                AnySelector::WeightedRoundRobin(WeightedRoundRobin::new())
            }
            Algorithm::LeastRequest => AnySelector::LeastRequest(LeastRequest::new(
                config.lr.active_request_bias,
                config.seed,
            )),
            Algorithm::Random => AnySelector::Random(Random::new(config.seed)),
            Algorithm::RingHash => AnySelector::RingHash(RingHash::new(
                config.ringhash.min_ring_size,
                config.ringhash.max_ring_size,
                config.seed,
            )),
            Algorithm::Maglev => {
                AnySelector::Maglev(Maglev::new(config.maglev.table_size, config.seed))
            }
            Algorithm::PeakEwma => AnySelector::PeakEwma(PeakEwma::new(
                config.peakewma.decay_time_ms as i64 * 1_000_000,
                config.seed,
            )),
        }
    }
}

impl Selector for AnySelector {
    fn on_membership_change(&mut self, backends: &[BackendInfo]) {
        match self {
            AnySelector::WeightedRoundRobin(s) => s.on_membership_change(backends),
            AnySelector::LeastRequest(s) => s.on_membership_change(backends),
            AnySelector::Random(s) => s.on_membership_change(backends),
            AnySelector::RingHash(s) => s.on_membership_change(backends),
            AnySelector::Maglev(s) => s.on_membership_change(backends),
            AnySelector::PeakEwma(s) => s.on_membership_change(backends),
        }
    }

    fn choose(
        &mut self,
        l7_id: u64,
        backends: &[BackendInfo],
        now_ns: i64,
    ) -> Option<SocketAddr> {
        match self {
            AnySelector::WeightedRoundRobin(s) => s.choose(l7_id, backends, now_ns),
            AnySelector::LeastRequest(s) => s.choose(l7_id, backends, now_ns),
            AnySelector::Random(s) => s.choose(l7_id, backends, now_ns),
            AnySelector::RingHash(s) => s.choose(l7_id, backends, now_ns),
            AnySelector::Maglev(s) => s.choose(l7_id, backends, now_ns),
            AnySelector::PeakEwma(s) => s.choose(l7_id, backends, now_ns),
        }
    }

    fn record_latency(&mut self, address: SocketAddr, rtt_ns: i64, now_ns: i64) {
        match self {
            AnySelector::WeightedRoundRobin(s) => s.record_latency(address, rtt_ns, now_ns),
            AnySelector::LeastRequest(s) => s.record_latency(address, rtt_ns, now_ns),
            AnySelector::Random(s) => s.record_latency(address, rtt_ns, now_ns),
            AnySelector::RingHash(s) => s.record_latency(address, rtt_ns, now_ns),
            AnySelector::Maglev(s) => s.record_latency(address, rtt_ns, now_ns),
            AnySelector::PeakEwma(s) => s.record_latency(address, rtt_ns, now_ns),
        }
    }

    fn notify_sent(&mut self, address: SocketAddr) {
        match self {
            AnySelector::WeightedRoundRobin(s) => s.notify_sent(address),
            AnySelector::LeastRequest(s) => s.notify_sent(address),
            AnySelector::Random(s) => s.notify_sent(address),
            AnySelector::RingHash(s) => s.notify_sent(address),
            AnySelector::Maglev(s) => s.notify_sent(address),
            AnySelector::PeakEwma(s) => s.notify_sent(address),
        }
    }

    fn notify_finished(&mut self, address: SocketAddr) {
        match self {
            AnySelector::WeightedRoundRobin(s) => s.notify_finished(address),
            AnySelector::LeastRequest(s) => s.notify_finished(address),
            AnySelector::Random(s) => s.notify_finished(address),
            AnySelector::RingHash(s) => s.notify_finished(address),
            AnySelector::Maglev(s) => s.notify_finished(address),
            AnySelector::PeakEwma(s) => s.notify_finished(address),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::net::SocketAddr;

    use crate::registry::BackendInfo;

    pub fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:9000", last).parse().unwrap()
    }

    pub fn backends(weights: &[u32]) -> Vec<BackendInfo> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| BackendInfo {
                address: addr(i as u8 + 1),
                weight,
                active_requests: 0,
            })
            .collect()
    }
}
