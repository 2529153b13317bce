//! Ballast Backend Selection
//!
//! This crate owns everything about *which* backend a request goes to: the
//! registry of configured backends, the selector contract, and the six
//! selection algorithms.
//!
//! # Overview
//!
//! - **[`registry`]** - Insertion-ordered backend set with per-backend
//!   weights and active-request counts
//! - **[`selector`]** - The [`Selector`](selector::Selector) trait and its
//!   implementations: weighted round-robin, least request, random,
//!   ring-hash, Maglev and peak-EWMA
//! - **[`ewma`]** - The peak-sensitive latency metric feeding the
//!   peak-EWMA selector
//! - **[`hashing`]** - Deterministic 64-bit hashing for the consistent
//!   hashing tables
//!
//! # Selector Lifecycle
//!
//! The proxy drives every selector through the same five calls: a
//! membership-change notification after registry mutation, `choose` per
//! request, and `notify_sent` / `notify_finished` / `record_latency` as the
//! request progresses. Algorithms that don't care about a signal simply
//! inherit the no-op default.

pub mod ewma;
pub mod hashing;
pub mod registry;
pub mod selector;

pub use registry::{BackendInfo, BackendRegistry};
pub use selector::{AnySelector, Selector};
