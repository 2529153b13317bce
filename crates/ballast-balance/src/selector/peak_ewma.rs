//! Peak-EWMA latency-aware selection.
//!
//! Power-of-two-choices over a per-backend load score: a peak-sensitive
//! EWMA of observed RTTs multiplied by outstanding work (see
//! [`crate::ewma`]). Backends that spike in latency immediately score
//! worse and shed traffic until the spike decays.
//!
//! Like [`Random`](crate::selector::Random), the candidate sampling
//! ignores configured weights; the load score is the only signal.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::ewma::EwmaMetric;
use crate::registry::BackendInfo;
use crate::selector::Selector;

const MAX_DISTINCT_ATTEMPTS: u32 = 10;

pub struct PeakEwma {
    decay_ns: i64,
    metrics: HashMap<SocketAddr, EwmaMetric>,
    rng: SmallRng,
}

impl PeakEwma {
    pub fn new(decay_ns: i64, seed: u64) -> Self {
        Self {
            decay_ns,
            metrics: HashMap::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn load_of(&mut self, address: SocketAddr, now_ns: i64) -> f64 {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.load(now_ns),
            None => {
                warn!(%address, "PeakEWMA: no metric for candidate backend; scoring it worst");
                f64::MAX
            }
        }
    }
}

impl Selector for PeakEwma {
    fn on_membership_change(&mut self, backends: &[BackendInfo]) {
        // Metrics for surviving backends keep their state; departed
        // backends are dropped and newcomers start fresh.
        let decay = self.decay_ns;
        self.metrics
            .retain(|address, _| backends.iter().any(|b| b.address == *address));
        for info in backends {
            self.metrics
                .entry(info.address)
                .or_insert_with(|| EwmaMetric::new(decay, 0));
        }
        debug!(metrics = self.metrics.len(), "PeakEWMA: metric map updated");
    }

    fn choose(
        &mut self,
        _l7_id: u64,
        backends: &[BackendInfo],
        now_ns: i64,
    ) -> Option<SocketAddr> {
        if backends.is_empty() {
            warn!("PeakEWMA: no backends available");
            return None;
        }
        if backends.len() == 1 {
            return Some(backends[0].address);
        }

        let idx1 = self.rng.gen_range(0..backends.len());
        let mut idx2 = idx1;
        let mut attempts = 0;
        while idx2 == idx1 && attempts < MAX_DISTINCT_ATTEMPTS {
            idx2 = self.rng.gen_range(0..backends.len());
            attempts += 1;
        }
        if idx1 == idx2 {
            debug!(attempts, "PeakEWMA: could not draw two distinct candidates");
            return Some(backends[idx1].address);
        }

        let addr1 = backends[idx1].address;
        let addr2 = backends[idx2].address;
        let load1 = self.load_of(addr1, now_ns);
        let load2 = self.load_of(addr2, now_ns);

        let chosen = if load1 < load2 {
            addr1
        } else if load2 < load1 {
            addr2
        } else if self.rng.gen::<f64>() < 0.5 {
            addr1
        } else {
            addr2
        };
        debug!(
            %addr1, load1, %addr2, load2, %chosen,
            "PeakEWMA choice"
        );
        Some(chosen)
    }

    fn record_latency(&mut self, address: SocketAddr, rtt_ns: i64, now_ns: i64) {
        match self.metrics.get_mut(&address) {
            Some(metric) => {
                metric.observe(rtt_ns, now_ns);
                debug!(
                    %address,
                    rtt_ms = rtt_ns / 1_000_000,
                    cost_ms = metric.cost_ns() / 1e6,
                    "PeakEWMA: recorded RTT"
                );
            }
            None => warn!(%address, "PeakEWMA: latency for unknown backend"),
        }
    }

    fn notify_sent(&mut self, address: SocketAddr) {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.inc_pending(),
            None => warn!(%address, "PeakEWMA: notify_sent for unknown backend"),
        }
    }

    fn notify_finished(&mut self, address: SocketAddr) {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.dec_pending(),
            None => warn!(%address, "PeakEWMA: notify_finished for unknown backend"),
        }
    }
}
