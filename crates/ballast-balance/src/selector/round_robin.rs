//! Smooth weighted round-robin.
//!
//! The nginx interleaving scheme: walk the backend list with a sliding
//! weight marker so that over one full cycle of `sum(weights)/gcd` picks,
//! backend *i* is chosen `weight_i / gcd` times, spread out rather than
//! bunched. Deterministic given membership and call order.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::registry::BackendInfo;
use crate::selector::Selector;

pub struct WeightedRoundRobin {
    current_index: usize,
    current_weight: i64,
    max_weight: u32,
    gcd_weight: u32,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            current_index: 0,
            current_weight: 0,
            max_weight: 0,
            gcd_weight: 0,
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for WeightedRoundRobin {
    fn on_membership_change(&mut self, backends: &[BackendInfo]) {
        self.max_weight = 0;
        self.gcd_weight = 0;
        for info in backends {
            if info.weight == 0 {
                continue;
            }
            self.max_weight = self.max_weight.max(info.weight);
            self.gcd_weight = if self.gcd_weight == 0 {
                info.weight
            } else {
                gcd(self.gcd_weight, info.weight)
            };
        }
        // Start one position before the first backend so the initial
        // post-increment pick lands on index 0.
        self.current_index = backends.len().saturating_sub(1);
        self.current_weight = 0;
        debug!(
            max_weight = self.max_weight,
            gcd_weight = self.gcd_weight,
            backends = backends.len(),
            "WRR state recalculated"
        );
    }

    fn choose(
        &mut self,
        _l7_id: u64,
        backends: &[BackendInfo],
        _now_ns: i64,
    ) -> Option<SocketAddr> {
        if backends.is_empty() {
            warn!("WRR: no backends available");
            return None;
        }
        if self.max_weight == 0 {
            // Every configured backend has zero weight.
            warn!("WRR: all backends have zero weight; falling back to the first");
            return Some(backends[0].address);
        }

        loop {
            self.current_index = (self.current_index + 1) % backends.len();
            if self.current_index == 0 {
                self.current_weight -= i64::from(self.gcd_weight);
                if self.current_weight <= 0 {
                    self.current_weight = i64::from(self.max_weight);
                }
            }

            let info = &backends[self.current_index];
            if info.weight > 0 && i64::from(info.weight) >= self.current_weight {
                debug!(
                    index = self.current_index,
                    address = %info.address,
                    weight = info.weight,
                    marker = self.current_weight,
                    "WRR choice"
                );
                return Some(info.address);
            }
        }
    }
}
