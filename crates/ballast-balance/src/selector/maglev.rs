//! Maglev consistent hashing.
//!
//! Builds a fixed-size lookup table by letting every positive-weight
//! backend claim slots along its own permutation of the table, weighted so
//! heavier backends claim proportionally more. Lookup is then a single
//! modulo: `table[H(l7_id) mod M]`. The table only changes on membership
//! change, and two builds over the same membership produce identical
//! tables.

use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::hashing;
use crate::registry::BackendInfo;
use crate::selector::Selector;

pub struct Maglev {
    table_size: u64,
    table: Vec<Option<SocketAddr>>,
    built: bool,
    rng: SmallRng,
}

struct BuildEntry {
    address: SocketAddr,
    weight: u32,
    offset: u64,
    skip: u64,
    next: u64,
    score: f64,
}

fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

impl Maglev {
    pub fn new(table_size: u64, seed: u64) -> Self {
        Self {
            table_size: table_size.max(1),
            table: Vec::new(),
            built: false,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Slot contents, for diagnostics and determinism checks.
    pub fn slot(&self, index: usize) -> Option<SocketAddr> {
        self.table.get(index).copied().flatten()
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    fn permutation_value(offset: u64, skip: u64, next: u64, m: u64) -> u64 {
        ((offset as u128 + skip as u128 * next as u128) % m as u128) as u64
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

impl Selector for Maglev {
    fn on_membership_change(&mut self, backends: &[BackendInfo]) {
        self.built = false;
        self.table.clear();

        let m = self.table_size;
        if backends.is_empty() {
            warn!("Maglev: no backends available; lookup table not built");
            return;
        }
        if !is_prime(m) {
            warn!(
                table_size = m,
                "Maglev: table size is not prime; slot distribution will be less even"
            );
        }

        let mut entries: Vec<BuildEntry> = Vec::with_capacity(backends.len());
        let mut max_weight = 0u32;
        for info in backends {
            if info.weight == 0 {
                debug!(address = %info.address, "Maglev: skipping zero-weight backend");
                continue;
            }
            max_weight = max_weight.max(info.weight);
            let key = info.address.to_string();
            let offset = hashing::hash_key(&key) % m;
            let skip = if m > 1 {
                hashing::hash_key(&format!("{}_skip", key)) % (m - 1) + 1
            } else {
                1
            };
            entries.push(BuildEntry {
                address: info.address,
                weight: info.weight,
                offset,
                skip,
                next: 0,
                score: 0.0,
            });
        }

        if entries.is_empty() {
            warn!("Maglev: no backend with positive weight; lookup table not built");
            return;
        }
        if entries.len() as u64 > m {
            warn!(
                backends = entries.len(),
                table_size = m,
                "Maglev: more positive-weight backends than table slots; some get none"
            );
        }

        // Deterministic fill order regardless of registry order.
        entries.sort_by(|a, b| {
            (a.offset, a.skip, a.address.to_string()).cmp(&(
                b.offset,
                b.skip,
                b.address.to_string(),
            ))
        });

        self.table = vec![None; m as usize];
        let mut filled = 0u64;
        let mut pass = 1u64;

        'fill: while filled < m {
            'entries: for entry in &mut entries {
                if (pass * u64::from(entry.weight)) as f64 >= entry.score {
                    entry.score += f64::from(max_weight);
                    let mut slot = Self::permutation_value(entry.offset, entry.skip, entry.next, m);
                    let mut probed = 0u64;
                    while self.table[slot as usize].is_some() {
                        entry.next += 1;
                        probed += 1;
                        if probed > m {
                            // With a non-prime table size a permutation whose
                            // skip shares a factor with M cycles over a strict
                            // subset of the slots; once that subset is full
                            // this entry can never place again.
                            continue 'entries;
                        }
                        slot = Self::permutation_value(entry.offset, entry.skip, entry.next, m);
                    }
                    self.table[slot as usize] = Some(entry.address);
                    entry.next += 1;
                    filled += 1;
                    if filled == m {
                        break 'fill;
                    }
                }
            }
            pass += 1;
            if pass > m * 2 && filled < m {
                error!(
                    pass,
                    filled,
                    table_size = m,
                    "Maglev: table build exceeded the pass limit; aborting"
                );
                self.table.clear();
                return;
            }
        }

        info!(table_size = m, backends = entries.len(), "Maglev: lookup table built");
        self.built = true;
    }

    fn choose(
        &mut self,
        l7_id: u64,
        backends: &[BackendInfo],
        _now_ns: i64,
    ) -> Option<SocketAddr> {
        if !self.built || self.table.is_empty() {
            warn!("Maglev: lookup table unavailable; falling back to random selection");
            return self.random_eligible(backends);
        }

        let request_hash = hashing::hash_l7_id(l7_id);
        let index = (request_hash % self.table_size) as usize;
        match self.table[index] {
            Some(address) => {
                debug!(l7_id, request_hash, index, %address, "Maglev choice");
                Some(address)
            }
            None => {
                error!(
                    l7_id,
                    index, "Maglev: lookup hit an unfilled slot; table build is inconsistent"
                );
                None
            }
        }
    }
}
