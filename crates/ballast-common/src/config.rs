//! Proxy configuration.
//!
//! The configuration surface covers the listener, the backend set and the
//! per-algorithm tuning knobs. Configs deserialize from JSON and are also
//! built up field-by-field from CLI flags; either way [`ProxyConfig::validate`]
//! runs before the listener starts and any violation is fatal.

use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BallastError, Result};

/// The backend-selection algorithm run by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Algorithm {
    /// Nginx-style smooth weighted round-robin.
    #[serde(alias = "wrr", alias = "WRR")]
    WeightedRoundRobin,
    /// Least request: power-of-two-choices, or dynamically weighted when
    /// backend weights differ.
    #[serde(alias = "lr", alias = "LR", alias = "least_request")]
    LeastRequest,
    /// Uniform random choice, ignoring weights.
    #[serde(alias = "random", alias = "Random")]
    Random,
    /// Ketama-style consistent hashing over the request's L7 identifier.
    #[serde(alias = "ringhash", alias = "ring_hash", alias = "RingHash")]
    RingHash,
    /// Maglev lookup-table consistent hashing.
    #[serde(alias = "maglev", alias = "Maglev")]
    Maglev,
    /// Peak-sensitive EWMA latency scoring with power-of-two-choices.
    #[serde(alias = "peakewma", alias = "peak_ewma", alias = "PeakEWMA")]
    PeakEwma,
}

impl Algorithm {
    /// Canonical name, as accepted on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::WeightedRoundRobin => "wrr",
            Algorithm::LeastRequest => "lr",
            Algorithm::Random => "random",
            Algorithm::RingHash => "ringhash",
            Algorithm::Maglev => "maglev",
            Algorithm::PeakEwma => "peakewma",
        }
    }
}

impl FromStr for Algorithm {
    type Err = BallastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wrr" | "weighted_round_robin" | "round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "lr" | "least_request" => Ok(Algorithm::LeastRequest),
            "random" => Ok(Algorithm::Random),
            "ringhash" | "ring_hash" => Ok(Algorithm::RingHash),
            "maglev" => Ok(Algorithm::Maglev),
            "peakewma" | "peak_ewma" => Ok(Algorithm::PeakEwma),
            other => Err(BallastError::Config(format!(
                "Unknown algorithm '{}' (expected one of: wrr, lr, random, ringhash, maglev, peakewma)",
                other
            ))),
        }
    }
}

/// One configured backend: where it lives and how much traffic it should get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackendSpec {
    /// Backend server address (IP:port).
    pub address: SocketAddr,
    /// Load balancing weight. Zero is legal but weighted algorithms will
    /// never select such a backend.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Tuning for the least-request selector.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeastRequestConfig {
    /// Bias applied to active request counts when weights differ:
    /// `effective = weight / (active + 1)^bias`. Must be >= 0.
    pub active_request_bias: f64,
}

impl Default for LeastRequestConfig {
    fn default() -> Self {
        Self {
            active_request_bias: 1.0,
        }
    }
}

/// Tuning for the ring-hash selector.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingHashConfig {
    /// Minimum number of virtual nodes on the ring.
    pub min_ring_size: u64,
    /// Maximum number of virtual nodes on the ring.
    pub max_ring_size: u64,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            min_ring_size: 1024,
            max_ring_size: 8 * 1024 * 1024,
        }
    }
}

/// Tuning for the Maglev selector.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaglevConfig {
    /// Lookup table size. Should be prime; a warning is logged otherwise.
    pub table_size: u64,
}

impl Default for MaglevConfig {
    fn default() -> Self {
        Self { table_size: 65537 }
    }
}

/// Tuning for the peak-EWMA selector.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeakEwmaConfig {
    /// EWMA decay window in milliseconds. Must be >= 1.
    pub decay_time_ms: u64,
}

impl Default for PeakEwmaConfig {
    fn default() -> Self {
        Self {
            decay_time_ms: 10_000,
        }
    }
}

/// Complete configuration for one proxy listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// TCP port the listener accepts on.
    pub listen_port: u16,
    /// Backend-selection algorithm.
    pub algorithm: Algorithm,
    /// Ordered backend set.
    pub backends: Vec<BackendSpec>,
    /// Seed for the listener's PRNG. All randomized selection (P2C sampling,
    /// tie-breaks, fallbacks) draws from this seeded stream, never from a
    /// process-global generator.
    pub seed: u64,
    pub lr: LeastRequestConfig,
    pub ringhash: RingHashConfig,
    pub maglev: MaglevConfig,
    pub peakewma: PeakEwmaConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 9000,
            algorithm: Algorithm::WeightedRoundRobin,
            backends: Vec::new(),
            seed: 0,
            lr: LeastRequestConfig::default(),
            ringhash: RingHashConfig::default(),
            maglev: MaglevConfig::default(),
            peakewma: PeakEwmaConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Parses a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProxyConfig = serde_json::from_str(json)
            .map_err(|e| BallastError::Config(format!("Invalid config JSON: {}", e)))?;
        Ok(config)
    }

    /// Checks the configuration for violations that must be fatal at start.
    ///
    /// # Errors
    ///
    /// Returns [`BallastError::Config`] for a negative (or non-finite)
    /// least-request bias, a zero Maglev table size, a zero or inverted
    /// ring size interval, or a sub-millisecond EWMA decay window.
    pub fn validate(&self) -> Result<()> {
        if !self.lr.active_request_bias.is_finite() || self.lr.active_request_bias < 0.0 {
            return Err(BallastError::Config(format!(
                "lr.active_request_bias must be >= 0, got {}",
                self.lr.active_request_bias
            )));
        }
        if self.maglev.table_size == 0 {
            return Err(BallastError::Config(
                "maglev.table_size must be at least 1".to_string(),
            ));
        }
        if self.ringhash.min_ring_size == 0 || self.ringhash.max_ring_size == 0 {
            return Err(BallastError::Config(
                "ringhash ring sizes must be at least 1".to_string(),
            ));
        }
        if self.ringhash.min_ring_size > self.ringhash.max_ring_size {
            return Err(BallastError::Config(format!(
                "ringhash.min_ring_size ({}) exceeds ringhash.max_ring_size ({})",
                self.ringhash.min_ring_size, self.ringhash.max_ring_size
            )));
        }
        if self.peakewma.decay_time_ms == 0 {
            return Err(BallastError::Config(
                "peakewma.decay_time_ms must be at least 1".to_string(),
            ));
        }
        for spec in &self.backends {
            if spec.weight == 0 {
                tracing::warn!(
                    address = %spec.address,
                    "Backend configured with zero weight; weighted algorithms will not select it"
                );
            }
        }
        Ok(())
    }
}
