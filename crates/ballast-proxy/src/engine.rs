//! The L7 proxy engine.
//!
//! A single-threaded state machine that owns all per-connection state for
//! one listener and is driven entirely by [`IoEvent`]s. Each client's byte
//! stream is reassembled into frames; each frame is routed through the
//! selector to a backend, reusing the per-(client, backend) connection when
//! one exists and opening one otherwise; each response is correlated back
//! by its sequence number, timed for RTT, and relayed to the originating
//! client.
//!
//! # State
//!
//! - `clients` - per accepted socket: RX buffer, TX backlog, and the map
//!   from backend address to the backend socket serving this client
//! - `backends` - per upstream socket: phase, RX buffer, TX backlog, and
//!   the owning client (the reverse map)
//! - `pending_connects` - one record per socket still connecting, holding
//!   the request that triggered the connect; consumed exactly once
//! - `send_times` - `(backend socket, seq) -> send time`, the RTT source
//!
//! # Accounting
//!
//! Every request increments its target's active count exactly once
//! (`note_sent`) and decrements it exactly once (`note_finished`) on
//! whichever path ends it: response received, connect failure, send
//! failure, mid-flight connection loss, or client teardown. The engine
//! updates the registry and forwards both signals to the selector, so
//! load-aware algorithms see the same picture the registry does.
//!
//! # Failure containment
//!
//! Any protocol violation or hard I/O error tears down the connection it
//! happened on and nothing else. Nothing is retried.

use std::collections::HashMap;
use std::net::SocketAddr;

use ballast_common::{FrameHeader, ProxyConfig, Result, MAX_FRAME_PAYLOAD};
use ballast_balance::registry::BackendRegistry;
use ballast_balance::selector::{AnySelector, Selector};
use tracing::{debug, error, info, warn};

use crate::host::{HostIo, IoEvent, SocketId};
use crate::stats::{ProxyStats, StatsSnapshot};

/// Cap on a client's reassembly buffer.
const CLIENT_RX_LIMIT: usize = 1024 * 1024;
/// Cap on a backend's reassembly buffer.
const BACKEND_RX_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendPhase {
    Connecting,
    Connected,
}

struct ClientConn {
    peer: SocketAddr,
    rx: Vec<u8>,
    tx_backlog: Vec<u8>,
    /// Backend sockets serving this client, by backend address.
    backends: HashMap<SocketAddr, SocketId>,
}

struct BackendConn {
    address: SocketAddr,
    /// The client this connection serves.
    client: SocketId,
    phase: BackendPhase,
    rx: Vec<u8>,
    tx_backlog: Vec<u8>,
}

/// A request waiting for its backend connection to finish establishing.
struct PendingConnect {
    client: SocketId,
    frame: Vec<u8>,
    client_peer: SocketAddr,
    target: SocketAddr,
}

/// The proxy state machine for one listener.
pub struct ProxyEngine {
    config: ProxyConfig,
    registry: BackendRegistry,
    selector: AnySelector,
    clients: HashMap<SocketId, ClientConn>,
    backends: HashMap<SocketId, BackendConn>,
    pending_connects: HashMap<SocketId, PendingConnect>,
    send_times: HashMap<(SocketId, u32), i64>,
    stats: ProxyStats,
}

impl ProxyEngine {
    /// Builds an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when validation fails; nothing is
    /// partially constructed.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let registry = BackendRegistry::from_specs(&config.backends);
        let mut selector = AnySelector::from_config(&config);
        selector.on_membership_change(registry.backends());
        Ok(Self {
            config,
            registry,
            selector,
            clients: HashMap::new(),
            backends: HashMap::new(),
            pending_connects: HashMap::new(),
            send_times: HashMap::new(),
            stats: ProxyStats::new(),
        })
    }

    /// Opens the listening socket.
    pub fn start(&mut self, io: &mut dyn HostIo) -> Result<()> {
        if self.registry.is_empty() {
            warn!("Starting with no backend servers configured");
        }
        io.listen(self.config.listen_port)?;
        info!(port = self.config.listen_port, algorithm = self.config.algorithm.name(), "Listening");
        Ok(())
    }

    /// Tears down every connection. The listener socket itself belongs to
    /// the host and is closed by it.
    pub fn stop(&mut self, io: &mut dyn HostIo) {
        info!(
            clients = self.clients.len(),
            pending = self.pending_connects.len(),
            "Stopping listener"
        );
        let client_ids: Vec<SocketId> = self.clients.keys().copied().collect();
        for client in client_ids {
            self.cleanup_client(client, io);
        }
        let pending_ids: Vec<SocketId> = self.pending_connects.keys().copied().collect();
        for socket in pending_ids {
            self.cleanup_backend(socket, false, io);
        }
    }

    /// Replaces the backend set.
    pub fn set_backends(&mut self, backends: Vec<(SocketAddr, u32)>) {
        self.registry.set_all(backends);
        self.selector.on_membership_change(self.registry.backends());
    }

    /// Adds a backend or updates an existing one's weight.
    pub fn add_backend(&mut self, address: SocketAddr, weight: u32) {
        self.registry.add_or_update(address, weight);
        self.selector.on_membership_change(self.registry.backends());
    }

    /// Dispatches one I/O event. Runs to completion without blocking.
    pub fn handle_event(&mut self, event: IoEvent, io: &mut dyn HostIo) {
        match event {
            IoEvent::Accepted { socket, peer } => self.on_accept(socket, peer),
            IoEvent::ConnectSucceeded { socket } => self.on_connect_success(socket, io),
            IoEvent::ConnectFailed { socket } => self.on_connect_fail(socket, io),
            IoEvent::Data { socket, bytes } => {
                if self.clients.contains_key(&socket) {
                    self.on_client_data(socket, bytes, io);
                } else if self.backends.contains_key(&socket) {
                    self.on_backend_data(socket, bytes, io);
                } else {
                    debug!(?socket, "Data for untracked socket (already closed); ignoring");
                }
            }
            IoEvent::Writable { socket, available } => self.on_writable(socket, available, io),
            IoEvent::Closed { socket } | IoEvent::Error { socket } => {
                if self.clients.contains_key(&socket) {
                    self.cleanup_client(socket, io);
                } else if self.backends.contains_key(&socket)
                    || self.pending_connects.contains_key(&socket)
                {
                    self.cleanup_backend(socket, false, io);
                } else {
                    debug!(?socket, "Close/error for untracked socket; ignoring");
                }
            }
        }
    }

    fn on_accept(&mut self, socket: SocketId, peer: SocketAddr) {
        info!(?socket, %peer, "Accepted client connection");
        self.clients.insert(
            socket,
            ClientConn {
                peer,
                rx: Vec::new(),
                tx_backlog: Vec::new(),
                backends: HashMap::new(),
            },
        );
        self.stats.client_accepted();
    }

    fn on_client_data(&mut self, client: SocketId, bytes: Vec<u8>, io: &mut dyn HostIo) {
        let overflow = match self.clients.get_mut(&client) {
            Some(conn) => {
                if conn.rx.len() + bytes.len() > CLIENT_RX_LIMIT {
                    true
                } else {
                    conn.rx.extend_from_slice(&bytes);
                    false
                }
            }
            None => return,
        };
        if overflow {
            warn!(?client, "Client receive buffer overflow; dropping connection");
            self.stats.dropped_protocol();
            self.cleanup_client(client, io);
            return;
        }

        loop {
            let frame = {
                let Some(conn) = self.clients.get_mut(&client) else {
                    return;
                };
                let Some(header) = FrameHeader::peek(&conn.rx) else {
                    break;
                };
                if header.payload_size > MAX_FRAME_PAYLOAD {
                    warn!(
                        ?client,
                        payload_size = header.payload_size,
                        "Client declared an oversized frame; dropping connection"
                    );
                    None
                } else {
                    let need = header.total_len();
                    if conn.rx.len() < need {
                        break;
                    }
                    Some(conn.rx.drain(..need).collect::<Vec<u8>>())
                }
            };
            match frame {
                Some(frame) => self.attempt_forward(client, frame, io),
                None => {
                    self.stats.dropped_protocol();
                    self.cleanup_client(client, io);
                    return;
                }
            }
        }
    }

    /// Routes one complete request frame to a backend.
    fn attempt_forward(&mut self, client: SocketId, frame: Vec<u8>, io: &mut dyn HostIo) {
        let Some(header) = FrameHeader::peek(&frame) else {
            error!(?client, "Frame shorter than its header reached forwarding");
            return;
        };
        let seq = header.seq;
        let now = io.now_ns();

        let Some(client_peer) = self.clients.get(&client).map(|c| c.peer) else {
            warn!(?client, seq, "Client state missing during forward attempt; dropping request");
            return;
        };

        let Some(target) = self
            .selector
            .choose(header.l7_id, self.registry.backends(), now)
        else {
            warn!(
                seq,
                l7_id = header.l7_id,
                %client_peer,
                "No backend chosen; dropping request"
            );
            self.stats.dropped_no_backend();
            return;
        };
        debug!(seq, l7_id = header.l7_id, %target, "Request assigned to backend");

        // Reuse the client's existing connection to this backend when one
        // is alive; requests queued while it is still connecting keep their
        // arrival order behind the pending frame.
        if let Some(backend_id) = self
            .clients
            .get(&client)
            .and_then(|c| c.backends.get(&target).copied())
        {
            if self.backends.contains_key(&backend_id) {
                self.note_sent(target);
                self.send_times.insert((backend_id, seq), now);
                self.stats.request_forwarded();
                if !self.send_to_backend(backend_id, &frame, io) {
                    self.send_times.remove(&(backend_id, seq));
                    self.note_finished(target);
                    self.stats.dropped_send_failed();
                    self.cleanup_backend(backend_id, false, io);
                }
                return;
            }
            debug!(
                ?backend_id,
                %target,
                "Stale backend socket entry; replacing with a fresh connection"
            );
            self.cleanup_backend(backend_id, true, io);
            if let Some(conn) = self.clients.get_mut(&client) {
                conn.backends.remove(&target);
            }
        }

        let backend_id = match io.connect(target) {
            Ok(id) => id,
            Err(e) => {
                warn!(%target, seq, error = %e, "Failed to initiate backend connection; dropping request");
                self.stats.dropped_connect_failed();
                return;
            }
        };
        info!(seq, %target, ?backend_id, "Establishing new backend connection");

        self.note_sent(target);
        self.pending_connects.insert(
            backend_id,
            PendingConnect {
                client,
                frame,
                client_peer,
                target,
            },
        );
        self.backends.insert(
            backend_id,
            BackendConn {
                address: target,
                client,
                phase: BackendPhase::Connecting,
                rx: Vec::new(),
                tx_backlog: Vec::new(),
            },
        );
        if let Some(conn) = self.clients.get_mut(&client) {
            conn.backends.insert(target, backend_id);
        }
    }

    fn on_connect_success(&mut self, backend_id: SocketId, io: &mut dyn HostIo) {
        let Some(pending) = self.pending_connects.remove(&backend_id) else {
            warn!(
                ?backend_id,
                "Backend connected with no pending request (client likely gone); closing"
            );
            self.cleanup_backend(backend_id, false, io);
            return;
        };

        if !self.clients.contains_key(&pending.client) {
            warn!(
                %pending.target,
                "Client closed before backend connected; dropping request"
            );
            self.note_finished(pending.target);
            self.cleanup_backend(backend_id, false, io);
            return;
        }

        let Some(header) = FrameHeader::peek(&pending.frame) else {
            error!(?backend_id, "Pending request frame lost its header");
            self.note_finished(pending.target);
            self.cleanup_backend(backend_id, false, io);
            return;
        };

        info!(
            %pending.target,
            %pending.client_peer,
            ?backend_id,
            seq = header.seq,
            "Backend connection established"
        );

        // The pending frame goes out first; anything queued while the
        // socket was connecting follows in arrival order.
        match self.backends.get_mut(&backend_id) {
            Some(conn) => {
                conn.phase = BackendPhase::Connected;
                let queued = std::mem::take(&mut conn.tx_backlog);
                let mut buf = pending.frame;
                buf.extend_from_slice(&queued);
                conn.tx_backlog = buf;
            }
            None => {
                error!(?backend_id, "Backend connection state missing at connect success");
                self.note_finished(pending.target);
                io.close(backend_id);
                return;
            }
        }

        self.send_times
            .insert((backend_id, header.seq), io.now_ns());
        self.stats.request_forwarded();
        self.flush_backend_tx(backend_id, io);
    }

    fn on_connect_fail(&mut self, backend_id: SocketId, io: &mut dyn HostIo) {
        if let Some(pending) = self.pending_connects.get(&backend_id) {
            warn!(
                %pending.target,
                ?backend_id,
                "Backend connection failed; dropping pending request"
            );
            self.stats.dropped_connect_failed();
        } else {
            warn!(
                ?backend_id,
                "Backend connection failed with no pending request (already cleaned up)"
            );
        }
        self.cleanup_backend(backend_id, false, io);
    }

    fn on_backend_data(&mut self, backend_id: SocketId, bytes: Vec<u8>, io: &mut dyn HostIo) {
        let overflow = match self.backends.get_mut(&backend_id) {
            Some(conn) => {
                if conn.rx.len() + bytes.len() > BACKEND_RX_LIMIT {
                    true
                } else {
                    conn.rx.extend_from_slice(&bytes);
                    false
                }
            }
            None => return,
        };
        if overflow {
            warn!(?backend_id, "Backend receive buffer overflow; dropping connection");
            self.stats.dropped_protocol();
            self.cleanup_backend(backend_id, false, io);
            return;
        }

        let client_alive = self
            .backends
            .get(&backend_id)
            .map(|c| self.clients.contains_key(&c.client))
            .unwrap_or(false);
        if !client_alive {
            debug!(?backend_id, "Owning client is gone; closing backend connection");
            self.cleanup_backend(backend_id, false, io);
            return;
        }

        loop {
            let parsed = {
                let Some(conn) = self.backends.get_mut(&backend_id) else {
                    return;
                };
                let Some(header) = FrameHeader::peek(&conn.rx) else {
                    break;
                };
                if header.payload_size > MAX_FRAME_PAYLOAD {
                    warn!(
                        ?backend_id,
                        payload_size = header.payload_size,
                        "Backend declared an oversized frame; dropping connection"
                    );
                    None
                } else {
                    let need = header.total_len();
                    if conn.rx.len() < need {
                        break;
                    }
                    let frame: Vec<u8> = conn.rx.drain(..need).collect();
                    Some((frame, header.seq, conn.address, conn.client))
                }
            };
            let Some((frame, seq, address, client)) = parsed else {
                self.stats.dropped_protocol();
                self.cleanup_backend(backend_id, false, io);
                return;
            };

            let now = io.now_ns();
            match self.send_times.remove(&(backend_id, seq)) {
                Some(sent_at) => {
                    let rtt = now - sent_at;
                    debug!(seq, %address, rtt_us = rtt / 1000, "Response received");
                    self.selector.record_latency(address, rtt, now);
                }
                None => {
                    warn!(seq, %address, "No send time recorded for response");
                }
            }
            self.note_finished(address);
            self.stats.response_relayed();

            if !self.send_to_client(client, &frame, io) {
                warn!(?client, seq, "Failed to relay response; dropping client");
                self.cleanup_client(client, io);
                return;
            }
        }
    }

    /// Queues or writes bytes toward a backend.
    ///
    /// Returns `false` on a hard send error; the caller unwinds the
    /// request's accounting and tears the connection down.
    fn send_to_backend(&mut self, backend_id: SocketId, bytes: &[u8], io: &mut dyn HostIo) -> bool {
        let Some(conn) = self.backends.get_mut(&backend_id) else {
            error!(?backend_id, "send_to_backend on untracked socket");
            return false;
        };

        if conn.phase == BackendPhase::Connecting || !conn.tx_backlog.is_empty() {
            conn.tx_backlog.extend_from_slice(bytes);
            return true;
        }

        let sent = io.send(backend_id, bytes);
        if sent < 0 {
            warn!(?backend_id, address = %conn.address, "Send to backend failed");
            return false;
        }
        let sent = sent as usize;
        if sent < bytes.len() {
            warn!(
                ?backend_id,
                sent,
                total = bytes.len(),
                "Short write to backend; pausing client reads"
            );
            conn.tx_backlog.extend_from_slice(&bytes[sent..]);
            let client = conn.client;
            io.notify_writable(backend_id);
            io.set_read_enabled(client, false);
        }
        true
    }

    /// Queues or writes bytes toward a client. Same contract as
    /// [`Self::send_to_backend`].
    fn send_to_client(&mut self, client: SocketId, bytes: &[u8], io: &mut dyn HostIo) -> bool {
        let Some(conn) = self.clients.get_mut(&client) else {
            warn!(?client, "send_to_client on untracked socket");
            return false;
        };

        if !conn.tx_backlog.is_empty() {
            conn.tx_backlog.extend_from_slice(bytes);
            return true;
        }

        let sent = io.send(client, bytes);
        if sent < 0 {
            warn!(?client, peer = %conn.peer, "Send to client failed");
            return false;
        }
        let sent = sent as usize;
        if sent < bytes.len() {
            warn!(
                ?client,
                sent,
                total = bytes.len(),
                "Short write to client; pausing backend reads"
            );
            conn.tx_backlog.extend_from_slice(&bytes[sent..]);
            io.notify_writable(client);
            for backend_id in conn.backends.values() {
                io.set_read_enabled(*backend_id, false);
            }
        }
        true
    }

    fn on_writable(&mut self, socket: SocketId, available: usize, io: &mut dyn HostIo) {
        debug!(?socket, available, "Socket writable");
        if self.backends.contains_key(&socket) {
            self.flush_backend_tx(socket, io);
        } else if self.clients.contains_key(&socket) {
            self.flush_client_tx(socket, io);
        } else {
            debug!(?socket, "Writable for untracked socket; ignoring");
        }
    }

    /// Drains a backend's TX backlog; once empty, the paired client reads
    /// resume.
    fn flush_backend_tx(&mut self, backend_id: SocketId, io: &mut dyn HostIo) {
        enum Outcome {
            Drained(SocketId),
            Partial,
            Failed,
        }
        let outcome = {
            let Some(conn) = self.backends.get_mut(&backend_id) else {
                return;
            };
            if conn.phase == BackendPhase::Connecting {
                return;
            }
            if conn.tx_backlog.is_empty() {
                Outcome::Drained(conn.client)
            } else {
                let sent = io.send(backend_id, &conn.tx_backlog);
                if sent < 0 {
                    Outcome::Failed
                } else {
                    conn.tx_backlog.drain(..sent as usize);
                    if conn.tx_backlog.is_empty() {
                        Outcome::Drained(conn.client)
                    } else {
                        Outcome::Partial
                    }
                }
            }
        };
        match outcome {
            Outcome::Drained(client) => io.set_read_enabled(client, true),
            Outcome::Partial => io.notify_writable(backend_id),
            Outcome::Failed => {
                warn!(?backend_id, "Flushing backend backlog failed");
                self.cleanup_backend(backend_id, false, io);
            }
        }
    }

    /// Drains a client's TX backlog; once empty, reads resume on all of the
    /// client's backend connections.
    fn flush_client_tx(&mut self, client: SocketId, io: &mut dyn HostIo) {
        enum Outcome {
            Drained(Vec<SocketId>),
            Partial,
            Failed,
        }
        let outcome = {
            let Some(conn) = self.clients.get_mut(&client) else {
                return;
            };
            if conn.tx_backlog.is_empty() {
                Outcome::Drained(conn.backends.values().copied().collect())
            } else {
                let sent = io.send(client, &conn.tx_backlog);
                if sent < 0 {
                    Outcome::Failed
                } else {
                    conn.tx_backlog.drain(..sent as usize);
                    if conn.tx_backlog.is_empty() {
                        Outcome::Drained(conn.backends.values().copied().collect())
                    } else {
                        Outcome::Partial
                    }
                }
            }
        };
        match outcome {
            Outcome::Drained(backend_ids) => {
                for backend_id in backend_ids {
                    io.set_read_enabled(backend_id, true);
                }
            }
            Outcome::Partial => io.notify_writable(client),
            Outcome::Failed => {
                warn!(?client, "Flushing client backlog failed");
                self.cleanup_client(client, io);
            }
        }
    }

    /// Tears down all state for one client: every backend connection it
    /// owns, any pending connects it originated, and finally the socket.
    fn cleanup_client(&mut self, client: SocketId, io: &mut dyn HostIo) {
        let Some(conn) = self.clients.remove(&client) else {
            io.close(client);
            return;
        };
        info!(?client, peer = %conn.peer, backends = conn.backends.len(), "Cleaning up client");

        for (_, backend_id) in conn.backends {
            self.cleanup_backend(backend_id, false, io);
        }

        let orphaned: Vec<SocketId> = self
            .pending_connects
            .iter()
            .filter(|(_, p)| p.client == client)
            .map(|(id, _)| *id)
            .collect();
        for backend_id in orphaned {
            warn!(?backend_id, "Pending connect orphaned by client teardown");
            self.cleanup_backend(backend_id, false, io);
        }

        io.close(client);
    }

    /// Tears down all state for one backend socket.
    ///
    /// This is the single place a backend connection's accounting unwinds:
    /// the pending-connect record (if any) and every outstanding
    /// `(socket, seq)` entry each produce exactly one `note_finished`.
    /// `map_erase_only` skips closing the socket, for entries whose socket
    /// is already gone.
    fn cleanup_backend(&mut self, backend_id: SocketId, map_erase_only: bool, io: &mut dyn HostIo) {
        let removed = self.backends.remove(&backend_id);
        let mut address = removed.as_ref().map(|c| c.address);

        if let Some(conn) = &removed {
            if let Some(client_conn) = self.clients.get_mut(&conn.client) {
                client_conn.backends.retain(|_, id| *id != backend_id);
            }
        }

        if let Some(pending) = self.pending_connects.remove(&backend_id) {
            address.get_or_insert(pending.target);
            debug!(?backend_id, target = %pending.target, "Dropping pending request");
            self.note_finished(pending.target);
        }

        let outstanding: Vec<(SocketId, u32)> = self
            .send_times
            .keys()
            .filter(|(socket, _)| *socket == backend_id)
            .copied()
            .collect();
        for key in outstanding {
            self.send_times.remove(&key);
            match address {
                Some(addr) => self.note_finished(addr),
                None => warn!(
                    ?backend_id,
                    seq = key.1,
                    "Outstanding request on socket with unknown backend address"
                ),
            }
        }

        if let Some(addr) = address {
            debug!(?backend_id, address = %addr, map_erase_only, "Backend socket cleaned up");
        }
        if !map_erase_only {
            io.close(backend_id);
        }
    }

    fn note_sent(&mut self, address: SocketAddr) {
        self.registry.note_sent(address);
        self.selector.notify_sent(address);
    }

    fn note_finished(&mut self, address: SocketAddr) {
        self.registry.note_finished(address);
        self.selector.notify_finished(address);
    }

    // Observability accessors.

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Active request count for one backend, zero if unknown.
    pub fn active_requests(&self, address: SocketAddr) -> u32 {
        self.registry
            .find(address)
            .map(|b| b.active_requests)
            .unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn backend_conn_count(&self) -> usize {
        self.backends.len()
    }

    pub fn pending_connect_count(&self) -> usize {
        self.pending_connects.len()
    }

    /// Requests sent and not yet answered, across all backend sockets.
    pub fn outstanding_request_count(&self) -> usize {
        self.send_times.len()
    }

    /// Outstanding `(socket, seq)` entries for one socket. Zero after that
    /// socket's cleanup, by invariant.
    pub fn outstanding_for(&self, socket: SocketId) -> usize {
        self.send_times.keys().filter(|(s, _)| *s == socket).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{pump, run_until_quiet, PeerBehavior, SimNet};
    use ballast_common::{Algorithm, BackendSpec, HEADER_LEN};

    const MS: i64 = 1_000_000;

    fn baddr(last: u8) -> SocketAddr {
        format!("10.1.0.{}:9100", last).parse().unwrap()
    }

    fn caddr(last: u8) -> SocketAddr {
        format!("192.168.0.{}:50000", last).parse().unwrap()
    }

    fn engine_with(algorithm: Algorithm, backends: &[(SocketAddr, u32)]) -> ProxyEngine {
        let config = ProxyConfig {
            algorithm,
            backends: backends
                .iter()
                .map(|&(address, weight)| BackendSpec { address, weight })
                .collect(),
            ..ProxyConfig::default()
        };
        ProxyEngine::new(config).unwrap()
    }

    fn frame(seq: u32, l7_id: u64, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            seq,
            timestamp_ns: 0,
            payload_size: payload.len() as u32,
            l7_id,
        };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    #[test]
    fn test_single_request_round_trip() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), 5 * MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        let request = frame(1, 42, b"hello backend");
        sim.client_send(client, &request);
        run_until_quiet(&mut engine, &mut sim);

        // The backend saw the request byte-identical.
        assert_eq!(sim.bytes_sent_to(baddr(1)), request);
        // The client got exactly one response header back.
        let delivered = sim.delivered_to(client);
        assert_eq!(delivered.len(), HEADER_LEN);
        let response = FrameHeader::peek(delivered).unwrap();
        assert_eq!(response.seq, 1);
        assert_eq!(response.l7_id, 42);
        assert_eq!(response.payload_size, 0);
        // Accounting is balanced.
        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.stats().requests_forwarded, 1);
        assert_eq!(engine.stats().responses_relayed, 1);
    }

    #[test]
    fn test_backend_connection_reused_per_client() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"a"));
        run_until_quiet(&mut engine, &mut sim);
        sim.client_send(client, &frame(2, 7, b"b"));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(sim.backend_sockets_for(baddr(1)).len(), 1);
        assert_eq!(engine.stats().requests_forwarded, 2);
        assert_eq!(engine.stats().responses_relayed, 2);
    }

    #[test]
    fn test_two_frames_in_one_segment() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        let mut segment = frame(1, 7, &[0xAA; 10]);
        segment.extend_from_slice(&frame(2, 7, &[0xBB; 20]));
        sim.client_send(client, &segment);
        run_until_quiet(&mut engine, &mut sim);

        let frames = sim.frames_sent_to(baddr(1));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), HEADER_LEN + 10);
        assert_eq!(frames[1].len(), HEADER_LEN + 20);
        assert_eq!(engine.stats().responses_relayed, 2);
    }

    #[test]
    fn test_partial_header_waits_for_more_data() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        let request = frame(1, 7, b"xyz");
        sim.client_send(client, &request[..10]);
        run_until_quiet(&mut engine, &mut sim);
        assert_eq!(engine.stats().requests_forwarded, 0);

        sim.client_send(client, &request[10..]);
        run_until_quiet(&mut engine, &mut sim);
        assert_eq!(engine.stats().requests_forwarded, 1);
        assert_eq!(sim.bytes_sent_to(baddr(1)), request);
    }

    #[test]
    fn test_connect_failure_drops_request_and_balances() {
        let mut sim = SimNet::new();
        sim.add_peer(
            baddr(1),
            PeerBehavior {
                refuse_connect: true,
                ..PeerBehavior::default()
            },
        );
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b""));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.pending_connect_count(), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.stats().requests_dropped_connect_failed, 1);
        assert_eq!(sim.delivered_to(client).len(), 0);
    }

    #[test]
    fn test_empty_registry_drops_requests() {
        let mut sim = SimNet::new();
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"payload"));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(engine.stats().requests_dropped_no_backend, 1);
        assert_eq!(engine.outstanding_request_count(), 0);
    }

    #[test]
    fn test_client_close_mid_flight_cleans_everything() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), 1000 * MS);
        let mut engine = engine_with(Algorithm::LeastRequest, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"slow"));
        pump(&mut engine, &mut sim);
        assert_eq!(engine.active_requests(baddr(1)), 1);

        sim.peer_close(client);
        pump(&mut engine, &mut sim);

        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.client_count(), 0);
        assert_eq!(engine.backend_conn_count(), 0);
        for socket in sim.backend_sockets_for(baddr(1)) {
            assert!(!sim.is_open(socket));
        }
    }

    #[test]
    fn test_backend_close_mid_flight_balances_accounting() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), 1000 * MS);
        let mut engine = engine_with(Algorithm::LeastRequest, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"slow"));
        pump(&mut engine, &mut sim);
        let backend_socket = sim.backend_sockets_for(baddr(1))[0];
        assert_eq!(engine.outstanding_for(backend_socket), 1);

        sim.peer_close(backend_socket);
        pump(&mut engine, &mut sim);

        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.outstanding_for(backend_socket), 0);
        assert_eq!(engine.backend_conn_count(), 0);
        // The client stays; its next request opens a fresh connection.
        assert_eq!(engine.client_count(), 1);
    }

    #[test]
    fn test_client_close_with_pending_connect() {
        // Close the client between connect initiation and completion: the
        // pending record must be consumed exactly once.
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        pump(&mut engine, &mut sim);
        // Deliver the request and the close together, then pump: the
        // connect outcome is queued behind them.
        sim.client_send(client, &frame(1, 7, b""));
        sim.peer_close(client);
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.pending_connect_count(), 0);
        assert_eq!(engine.client_count(), 0);
        assert_eq!(engine.backend_conn_count(), 0);
    }

    #[test]
    fn test_oversized_frame_drops_client() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        let header = FrameHeader {
            seq: 1,
            timestamp_ns: 0,
            payload_size: MAX_FRAME_PAYLOAD + 1,
            l7_id: 7,
        };
        sim.client_send(client, &header.encode());
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(engine.client_count(), 0);
        assert!(!sim.is_open(client));
        assert_eq!(engine.stats().connections_dropped_protocol, 1);
        assert_eq!(engine.stats().requests_forwarded, 0);
    }

    #[test]
    fn test_short_write_to_backend_backpressures_client() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        // First request establishes the connection.
        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"first"));
        run_until_quiet(&mut engine, &mut sim);
        let backend_socket = sim.backend_sockets_for(baddr(1))[0];

        // Cap the backend socket so the second request short-writes.
        sim.set_send_limit(backend_socket, Some(10));
        let second = frame(2, 7, b"second request payload");
        sim.client_send(client, &second);
        pump(&mut engine, &mut sim);
        assert!(!sim.read_enabled(client), "client reads should be paused");

        // Opening the window flushes the tail and resumes reads.
        sim.release_writes(backend_socket);
        run_until_quiet(&mut engine, &mut sim);
        assert!(sim.read_enabled(client));

        let frames = sim.frames_sent_to(baddr(1));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], second);
        assert_eq!(engine.stats().responses_relayed, 2);
    }

    #[test]
    fn test_short_write_to_client_backpressures_backend() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"x"));
        pump(&mut engine, &mut sim);
        let backend_socket = sim.backend_sockets_for(baddr(1))[0];

        // The response will only partially fit into the client socket.
        sim.set_send_limit(client, Some(5));
        run_until_quiet(&mut engine, &mut sim);
        assert!(!sim.read_enabled(backend_socket));
        assert_eq!(sim.delivered_to(client).len(), 5);

        sim.release_writes(client);
        run_until_quiet(&mut engine, &mut sim);
        assert!(sim.read_enabled(backend_socket));
        assert_eq!(sim.delivered_to(client).len(), HEADER_LEN);
    }

    #[test]
    fn test_in_flight_requests_match_active_counts() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), 1000 * MS);
        sim.add_echo_peer(baddr(2), 1000 * MS);
        let mut engine = engine_with(Algorithm::LeastRequest, &[(baddr(1), 1), (baddr(2), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        for seq in 1..=4 {
            sim.client_send(client, &frame(seq, u64::from(seq), b"q"));
        }
        pump(&mut engine, &mut sim);

        let total_active = engine.active_requests(baddr(1)) + engine.active_requests(baddr(2));
        assert_eq!(total_active, 4);
        assert_eq!(engine.outstanding_request_count(), 4);

        run_until_quiet(&mut engine, &mut sim);
        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.active_requests(baddr(2)), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.stats().responses_relayed, 4);
    }

    #[test]
    fn test_two_clients_get_separate_backend_connections() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client_a = sim.client_connect(caddr(1));
        let client_b = sim.client_connect(caddr(2));
        sim.client_send(client_a, &frame(1, 7, b"a"));
        sim.client_send(client_b, &frame(1, 7, b"b"));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(sim.backend_sockets_for(baddr(1)).len(), 2);
        assert_eq!(sim.delivered_to(client_a).len(), HEADER_LEN);
        assert_eq!(sim.delivered_to(client_b).len(), HEADER_LEN);
    }

    #[test]
    fn test_requests_queued_while_connecting_follow_in_order() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        pump(&mut engine, &mut sim);
        // Both requests arrive before the connect result: the second one
        // queues behind the pending frame.
        let first = frame(1, 7, b"first");
        let second = frame(2, 7, b"second");
        let mut both = first.clone();
        both.extend_from_slice(&second);
        sim.client_send(client, &both);
        run_until_quiet(&mut engine, &mut sim);

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(sim.bytes_sent_to(baddr(1)), expected);
        assert_eq!(sim.backend_sockets_for(baddr(1)).len(), 1);
        assert_eq!(engine.stats().responses_relayed, 2);
    }

    #[test]
    fn test_stop_tears_down_all_connections() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), 1000 * MS);
        let mut engine = engine_with(Algorithm::LeastRequest, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"q"));
        pump(&mut engine, &mut sim);

        engine.stop(&mut sim);
        assert_eq!(engine.client_count(), 0);
        assert_eq!(engine.backend_conn_count(), 0);
        assert_eq!(engine.pending_connect_count(), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert!(!sim.is_open(client));
    }

    #[test]
    fn test_membership_change_reroutes_new_requests() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        sim.add_echo_peer(baddr(2), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"a"));
        run_until_quiet(&mut engine, &mut sim);

        engine.set_backends(vec![(baddr(2), 1)]);
        sim.client_send(client, &frame(2, 7, b"b"));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(sim.frames_sent_to(baddr(1)).len(), 1);
        assert_eq!(sim.frames_sent_to(baddr(2)).len(), 1);
    }

    #[test]
    fn test_send_failure_unwinds_request() {
        let mut sim = SimNet::new();
        sim.add_echo_peer(baddr(1), MS);
        let mut engine = engine_with(Algorithm::WeightedRoundRobin, &[(baddr(1), 1)]);
        engine.start(&mut sim).unwrap();

        let client = sim.client_connect(caddr(1));
        sim.client_send(client, &frame(1, 7, b"a"));
        run_until_quiet(&mut engine, &mut sim);
        let backend_socket = sim.backend_sockets_for(baddr(1))[0];

        sim.set_fail_sends(backend_socket, true);
        sim.client_send(client, &frame(2, 7, b"b"));
        run_until_quiet(&mut engine, &mut sim);

        assert_eq!(engine.active_requests(baddr(1)), 0);
        assert_eq!(engine.outstanding_request_count(), 0);
        assert_eq!(engine.stats().requests_dropped_send_failed, 1);
        assert!(!sim.is_open(backend_socket));
    }
}

