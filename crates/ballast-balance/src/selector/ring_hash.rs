//! Ketama-style consistent hashing.
//!
//! Each positive-weight backend contributes virtual nodes to an ordered
//! ring of 64-bit hash points. A request hashes its L7 identifier and walks
//! clockwise to the first point at or past it; removing a backend only
//! reassigns the keys that mapped to its own points.
//!
//! The ring targets `positive_backends x 100` virtual nodes, clamped to the
//! configured `[min, max]` interval, and splits that total across backends
//! in proportion to weight (floor of one node each).

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::hashing;
use crate::registry::BackendInfo;
use crate::selector::Selector;

/// Baseline virtual nodes per positive-weight backend.
const HASHES_PER_HOST: u64 = 100;

pub struct RingHash {
    min_ring_size: u64,
    max_ring_size: u64,
    ring: BTreeMap<u64, SocketAddr>,
    rng: SmallRng,
}

impl RingHash {
    pub fn new(min_ring_size: u64, max_ring_size: u64, seed: u64) -> Self {
        Self {
            min_ring_size: min_ring_size.max(1),
            max_ring_size: max_ring_size.max(1),
            ring: BTreeMap::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Number of points currently on the ring.
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Points owned by one backend, for rebalance diagnostics.
    pub fn points_for(&self, address: SocketAddr) -> usize {
        self.ring.values().filter(|&&a| a == address).count()
    }

    fn random_eligible(&mut self, backends: &[BackendInfo]) -> Option<SocketAddr> {
        let eligible: Vec<&BackendInfo> = backends.iter().filter(|b| b.weight > 0).collect();
        if eligible.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..eligible.len());
        Some(eligible[index].address)
    }
}

impl Selector for RingHash {
    fn on_membership_change(&mut self, backends: &[BackendInfo]) {
        self.ring.clear();

        let mut min_ring = self.min_ring_size;
        let max_ring = self.max_ring_size;
        if min_ring > max_ring {
            warn!(
                min_ring,
                max_ring, "RingHash: min ring size exceeds max; clamping min to max"
            );
            min_ring = max_ring;
        }

        let total_weight: f64 = backends
            .iter()
            .filter(|b| b.weight > 0)
            .map(|b| f64::from(b.weight))
            .sum();
        let positive_count = backends.iter().filter(|b| b.weight > 0).count() as u64;
        if positive_count == 0 {
            warn!("RingHash: no backend with positive weight; ring left empty");
            return;
        }

        let desired = positive_count * HASHES_PER_HOST;
        let target = desired.clamp(min_ring, max_ring);

        for info in backends {
            if info.weight == 0 {
                continue;
            }
            let fraction = f64::from(info.weight) / total_weight;
            let hashes = ((target as f64 * fraction).round() as u64).max(1);
            for i in 0..hashes {
                let key = hashing::virtual_node_key(info.address, i);
                let point = hashing::hash_key(&key);
                // 64-bit collisions are rare; the latest insertion wins.
                if let Some(previous) = self.ring.insert(point, info.address) {
                    if previous != info.address {
                        warn!(
                            point,
                            %previous,
                            winner = %info.address,
                            "RingHash: hash point collision; later backend wins"
                        );
                    }
                }
            }
        }

        info!(
            virtual_nodes = self.ring.len(),
            target, positive_count, "RingHash: ring rebuilt"
        );
    }

    fn choose(
        &mut self,
        l7_id: u64,
        backends: &[BackendInfo],
        _now_ns: i64,
    ) -> Option<SocketAddr> {
        if self.ring.is_empty() {
            warn!("RingHash: ring empty; falling back to random selection");
            return self.random_eligible(backends);
        }

        let request_hash = hashing::hash_l7_id(l7_id);
        let chosen = self
            .ring
            .range(request_hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(point, address)| {
                debug!(l7_id, request_hash, point, %address, "RingHash choice");
                *address
            });
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::test_util::{addr, backends};
    use std::collections::HashMap;

    fn ring(min: u64, max: u64, set: &[BackendInfo]) -> RingHash {
        let mut selector = RingHash::new(min, max, 3);
        selector.on_membership_change(set);
        selector
    }

    #[test]
    fn test_same_l7_id_maps_to_same_backend() {
        let set = backends(&[1, 1, 1]);
        let mut selector = ring(1024, 8 * 1024 * 1024, &set);
        let first = selector.choose(42, &set, 0);
        for _ in 0..10 {
            assert_eq!(selector.choose(42, &set, 0), first);
        }
    }

    #[test]
    fn test_every_positive_backend_owns_points() {
        let set = backends(&[1, 1, 1]);
        let selector = ring(1024, 8 * 1024 * 1024, &set);
        for info in &set {
            assert!(
                selector.points_for(info.address) >= 1,
                "{} owns no ring points",
                info.address
            );
        }
    }

    #[test]
    fn test_zero_weight_excluded_from_ring() {
        let set = backends(&[1, 0, 1]);
        let selector = ring(1024, 8 * 1024 * 1024, &set);
        assert_eq!(selector.points_for(addr(2)), 0);
    }

    #[test]
    fn test_ring_size_clamped_to_min() {
        let set = backends(&[1]);
        let selector = ring(1024, 8 * 1024 * 1024, &set);
        // One backend targets max(100, 1024) = 1024 nodes; a few may be
        // lost to collisions.
        assert!(selector.ring_len() > 1000);
    }

    #[test]
    fn test_ring_size_clamped_to_max() {
        let set = backends(&[1, 1, 1]);
        let selector = ring(1, 30, &set);
        assert!(selector.ring_len() <= 30);
    }

    #[test]
    fn test_removal_preserves_most_assignments() {
        // Removing one of three equal backends must leave keys that did not
        // map to it untouched. With min_ring below the natural target the
        // surviving backends keep the exact same virtual nodes (100 each)
        // after the rebuild, so no surviving assignment may move.
        let full = backends(&[1, 1, 1]);
        let mut selector = ring(1, 8 * 1024 * 1024, &full);

        let before: HashMap<u64, SocketAddr> = (0..3000u64)
            .map(|id| (id, selector.choose(id, &full, 0).unwrap()))
            .collect();

        // Drop backend B (index 1).
        let reduced: Vec<BackendInfo> = full
            .iter()
            .filter(|b| b.address != addr(2))
            .cloned()
            .collect();
        selector.on_membership_change(&reduced);

        let mut moved = 0usize;
        for (id, old) in &before {
            let new = selector.choose(*id, &reduced, 0).unwrap();
            if *old == addr(2) {
                assert_ne!(new, addr(2));
            } else if new != *old {
                moved += 1;
            }
        }
        // Only keys that belonged to the removed backend should move.
        assert_eq!(moved, 0, "{} surviving assignments moved", moved);
    }

    #[test]
    fn test_weights_shape_point_counts() {
        let set = backends(&[1, 3]);
        let selector = ring(1024, 8 * 1024 * 1024, &set);
        let light = selector.points_for(addr(1));
        let heavy = selector.points_for(addr(2));
        assert!(heavy > 2 * light, "light={} heavy={}", light, heavy);
    }

    #[test]
    fn test_empty_registry_returns_none() {
        let mut selector = RingHash::new(1024, 8 * 1024 * 1024, 3);
        selector.on_membership_change(&[]);
        assert_eq!(selector.choose(1, &[], 0), None);
    }

    #[test]
    fn test_all_zero_weights_falls_back_to_none() {
        let set = backends(&[0, 0]);
        let mut selector = RingHash::new(1024, 8 * 1024 * 1024, 3);
        selector.on_membership_change(&set);
        assert_eq!(selector.choose(1, &set, 0), None);
    }

    #[test]
    fn test_wraparound_lookup() {
        // Any l7_id must resolve, including ones hashing past the highest
        // ring point.
        let set = backends(&[1, 1]);
        let mut selector = ring(16, 64, &set);
        for id in 0..1000u64 {
            assert!(selector.choose(id, &set, 0).is_some());
        }
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let set = backends(&[1, 2, 3]);
        let mut a = ring(1024, 8 * 1024 * 1024, &set);
        let mut b = ring(1024, 8 * 1024 * 1024, &set);
        for id in 0..500u64 {
            assert_eq!(a.choose(id, &set, 0), b.choose(id, &set, 0));
        }
    }
}
