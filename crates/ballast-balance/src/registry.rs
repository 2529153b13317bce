//! The backend registry.
//!
//! An insertion-ordered set of backend servers, unique by address. The order
//! is stable across weight updates of existing entries, which the
//! round-robin selector relies on for its deterministic cycle.

use std::net::SocketAddr;

use ballast_common::BackendSpec;
use tracing::{debug, info, warn};

/// A single backend server as the selectors see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    /// Backend server address (IP:port).
    pub address: SocketAddr,
    /// Weight assigned for load balancing decisions.
    pub weight: u32,
    /// Count of L7 requests currently in flight on this backend.
    ///
    /// Mutated only through [`BackendRegistry::note_sent`] and
    /// [`BackendRegistry::note_finished`].
    pub active_requests: u32,
}

impl BackendInfo {
    fn new(address: SocketAddr, weight: u32) -> Self {
        Self {
            address,
            weight,
            active_requests: 0,
        }
    }
}

/// Ordered collection of configured backends.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<BackendInfo>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration specs.
    pub fn from_specs(specs: &[BackendSpec]) -> Self {
        let mut registry = Self::new();
        registry.set_all(specs.iter().map(|s| (s.address, s.weight)));
        registry
    }

    /// Replaces the entire backend set.
    ///
    /// Active request counts reset to zero; any in-flight accounting against
    /// the previous set is discarded with it.
    pub fn set_all<I>(&mut self, backends: I)
    where
        I: IntoIterator<Item = (SocketAddr, u32)>,
    {
        self.backends.clear();
        for (address, weight) in backends {
            if weight == 0 {
                warn!(
                    %address,
                    "Backend added with zero weight; weighted algorithms will not select it"
                );
            }
            if self.find(address).is_some() {
                warn!(%address, "Duplicate backend address in set_all; keeping first entry");
                continue;
            }
            self.backends.push(BackendInfo::new(address, weight));
        }
        info!(count = self.backends.len(), "Backend set replaced");
    }

    /// Adds a backend, or updates its weight in place if already present.
    ///
    /// Updating preserves the entry's position and its active request count.
    pub fn add_or_update(&mut self, address: SocketAddr, weight: u32) {
        if weight == 0 {
            warn!(
                %address,
                "Backend added with zero weight; weighted algorithms will not select it"
            );
        }
        match self.find_mut(address) {
            Some(existing) => {
                info!(
                    %address,
                    old_weight = existing.weight,
                    new_weight = weight,
                    active = existing.active_requests,
                    "Updating backend weight"
                );
                existing.weight = weight;
            }
            None => {
                info!(%address, weight, "Adding backend");
                self.backends.push(BackendInfo::new(address, weight));
            }
        }
    }

    /// Looks up a backend by address.
    pub fn find(&self, address: SocketAddr) -> Option<&BackendInfo> {
        self.backends.iter().find(|b| b.address == address)
    }

    pub fn find_mut(&mut self, address: SocketAddr) -> Option<&mut BackendInfo> {
        self.backends.iter_mut().find(|b| b.address == address)
    }

    /// The ordered backend snapshot selectors read during `choose`.
    pub fn backends(&self) -> &[BackendInfo] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Records that a request was handed to `address` (sent, or queued
    /// behind a connection being established).
    pub fn note_sent(&mut self, address: SocketAddr) {
        match self.find_mut(address) {
            Some(info) => {
                info.active_requests += 1;
                debug!(%address, active = info.active_requests, "Request sent");
            }
            None => warn!(%address, "note_sent for unknown backend"),
        }
    }

    /// Records that a request against `address` finished: a response
    /// arrived, or an error made one impossible.
    ///
    /// Saturates at zero; an underflow attempt is logged as it indicates a
    /// bookkeeping bug in the caller.
    pub fn note_finished(&mut self, address: SocketAddr) {
        match self.find_mut(address) {
            Some(info) => {
                if info.active_requests > 0 {
                    info.active_requests -= 1;
                } else {
                    warn!(%address, "note_finished would take active requests below zero");
                }
                debug!(%address, active = info.active_requests, "Request finished");
            }
            None => warn!(%address, "note_finished for unknown backend"),
        }
    }
}
