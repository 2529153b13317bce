//! Uniform random selection.
//!
//! Picks uniformly over the whole registry. Weights are deliberately
//! ignored: this selector exists as the baseline the weighted algorithms
//! are measured against, and that includes zero-weight entries.

use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::registry::BackendInfo;
use crate::selector::Selector;

pub struct Random {
    rng: SmallRng,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Selector for Random {
    fn on_membership_change(&mut self, _backends: &[BackendInfo]) {}

    fn choose(
        &mut self,
        _l7_id: u64,
        backends: &[BackendInfo],
        _now_ns: i64,
    ) -> Option<SocketAddr> {
        if backends.is_empty() {
            warn!("Random: no backends available");
            return None;
        }
        let index = self.rng.gen_range(0..backends.len());
        debug!(index, address = %backends[index].address, "Random choice");
        Some(backends[index].address)
    }
}
