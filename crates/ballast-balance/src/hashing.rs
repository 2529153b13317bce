//! Deterministic hashing for the consistent-hashing selectors.
//!
//! Both ring-hash and Maglev need a 64-bit hash that is stable across
//! processes and Rust versions: the lookup structures they build must come
//! out identical for identical membership, run after run. The standard
//! library's `DefaultHasher` guarantees neither, so this module uses FNV-1a
//! with the canonical 64-bit parameters.

use std::net::SocketAddr;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over a byte slice.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a string key.
pub fn hash_key(key: &str) -> u64 {
    fnv1a64(key.as_bytes())
}

/// Hashes an L7 identifier the way the consistent-hashing selectors expect:
/// over its decimal string representation.
pub fn hash_l7_id(l7_id: u64) -> u64 {
    hash_key(&l7_id.to_string())
}

/// Key string for one virtual node: `"{address}_{index}"`.
pub fn virtual_node_key(address: SocketAddr, index: u64) -> String {
    format!("{}_{}", address, index)
}
