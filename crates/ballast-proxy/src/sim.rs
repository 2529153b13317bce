//! Deterministic in-memory host for driving the engine in tests.
//!
//! [`SimNet`] implements [`HostIo`] with a manual clock, an ordered event
//! queue and scripted backend peers that echo each request's header back
//! after a fixed delay (responses carry no payload, like a fixed-delay echo
//! server). Tests inject client traffic, pump the event loop, advance time
//! and assert on the exact bytes delivered to each socket.
//!
//! Fault injection: peers can refuse connections, sockets can be capped to
//! short writes or forced to fail sends, and either side can be closed
//! mid-flight.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use ballast_common::{BallastError, FrameHeader, Result};

use crate::engine::ProxyEngine;
use crate::host::{HostIo, IoEvent, SocketId};

/// Scripted behavior of one backend address.
#[derive(Debug, Clone, Copy)]
pub struct PeerBehavior {
    /// Delay between receiving a complete request and emitting its response.
    pub delay_ns: i64,
    /// Refuse connection attempts outright.
    pub refuse_connect: bool,
    /// Parse requests and echo responses automatically. When off, the test
    /// crafts backend bytes itself via [`SimNet::backend_send`].
    pub auto_respond: bool,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            delay_ns: 1_000_000,
            refuse_connect: false,
            auto_respond: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Client,
    Backend(SocketAddr),
}

struct SimSocket {
    kind: SocketKind,
    open: bool,
    read_enabled: bool,
    /// Data chunks held back while reads are disabled.
    held: Vec<Vec<u8>>,
    /// Every byte the engine successfully sent on this socket.
    delivered: Vec<u8>,
    /// Per-call cap on bytes accepted by `send`.
    send_limit: Option<usize>,
    /// Force sends to fail with a hard error.
    fail_sends: bool,
    /// Whether the engine asked for a writable notification.
    writable_requested: bool,
    /// Scripted server-side reassembly buffer (backend sockets only).
    srv_rx: Vec<u8>,
}

impl SimSocket {
    fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            open: true,
            read_enabled: true,
            held: Vec::new(),
            delivered: Vec::new(),
            send_limit: None,
            fail_sends: false,
            writable_requested: false,
            srv_rx: Vec::new(),
        }
    }
}

/// The in-memory network and clock.
pub struct SimNet {
    now_ns: i64,
    next_id: u64,
    next_timed_seq: u64,
    listen_port: Option<u16>,
    ready: VecDeque<IoEvent>,
    /// Future events as `(due, insertion order, event)`.
    timed: Vec<(i64, u64, IoEvent)>,
    sockets: HashMap<SocketId, SimSocket>,
    peers: HashMap<SocketAddr, PeerBehavior>,
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            now_ns: 0,
            next_id: 1,
            next_timed_seq: 0,
            listen_port: None,
            ready: VecDeque::new(),
            timed: Vec::new(),
            sockets: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    fn push_timed(&mut self, due: i64, event: IoEvent) {
        let seq = self.next_timed_seq;
        self.next_timed_seq += 1;
        self.timed.push((due, seq, event));
        self.timed.sort_by_key(|(d, s, _)| (*d, *s));
    }

    /// Delivers bytes toward the engine, honoring the read-enable gate.
    fn deliver_data(&mut self, socket: SocketId, bytes: Vec<u8>) {
        match self.sockets.get_mut(&socket) {
            Some(s) if s.open => {
                if s.read_enabled {
                    self.ready.push_back(IoEvent::Data { socket, bytes });
                } else {
                    s.held.push(bytes);
                }
            }
            _ => {}
        }
    }

    // --- Test-side controls ---

    /// Registers a scripted backend peer.
    pub fn add_peer(&mut self, address: SocketAddr, behavior: PeerBehavior) {
        self.peers.insert(address, behavior);
    }

    /// Registers an echoing peer with the given response delay.
    pub fn add_echo_peer(&mut self, address: SocketAddr, delay_ns: i64) {
        self.add_peer(
            address,
            PeerBehavior {
                delay_ns,
                ..PeerBehavior::default()
            },
        );
    }

    /// A new client connects to the listener.
    pub fn client_connect(&mut self, peer: SocketAddr) -> SocketId {
        assert!(
            self.listen_port.is_some(),
            "client_connect before the engine started listening"
        );
        let socket = self.alloc_id();
        self.sockets.insert(socket, SimSocket::new(SocketKind::Client));
        self.ready.push_back(IoEvent::Accepted { socket, peer });
        socket
    }

    /// Client-side bytes arriving at the proxy.
    pub fn client_send(&mut self, socket: SocketId, bytes: &[u8]) {
        self.deliver_data(socket, bytes.to_vec());
    }

    /// Peer closes the connection (either side).
    pub fn peer_close(&mut self, socket: SocketId) {
        self.ready.push_back(IoEvent::Closed { socket });
    }

    /// Socket-level failure (either side).
    pub fn peer_error(&mut self, socket: SocketId) {
        self.ready.push_back(IoEvent::Error { socket });
    }

    /// Raw bytes from a (non-auto-responding) backend toward the proxy.
    pub fn backend_send(&mut self, socket: SocketId, bytes: &[u8]) {
        self.deliver_data(socket, bytes.to_vec());
    }

    /// Caps how many bytes a single `send` call accepts on `socket`.
    pub fn set_send_limit(&mut self, socket: SocketId, limit: Option<usize>) {
        if let Some(s) = self.sockets.get_mut(&socket) {
            s.send_limit = limit;
        }
    }

    /// Makes every send on `socket` fail.
    pub fn set_fail_sends(&mut self, socket: SocketId, fail: bool) {
        if let Some(s) = self.sockets.get_mut(&socket) {
            s.fail_sends = fail;
        }
    }

    /// Lifts any send cap and satisfies a pending writable request.
    pub fn release_writes(&mut self, socket: SocketId) {
        if let Some(s) = self.sockets.get_mut(&socket) {
            s.send_limit = None;
            if s.writable_requested {
                s.writable_requested = false;
                self.ready.push_back(IoEvent::Writable {
                    socket,
                    available: usize::MAX,
                });
            }
        }
    }

    /// Advances the clock, releasing timed events that fall due.
    pub fn advance(&mut self, dt_ns: i64) {
        self.now_ns += dt_ns;
        let now = self.now_ns;
        let mut due: Vec<(i64, u64, IoEvent)> = Vec::new();
        self.timed.retain(|entry| {
            if entry.0 <= now {
                due.push(entry.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(d, s, _)| (*d, *s));
        for (_, _, event) in due {
            match event {
                IoEvent::Data { socket, bytes } => self.deliver_data(socket, bytes),
                other => self.ready.push_back(other),
            }
        }
    }

    /// Earliest pending timed event, if any.
    pub fn next_due_ns(&self) -> Option<i64> {
        self.timed.iter().map(|(d, _, _)| *d).min()
    }

    pub fn pop_event(&mut self) -> Option<IoEvent> {
        self.ready.pop_front()
    }

    pub fn now(&self) -> i64 {
        self.now_ns
    }

    // --- Assertion helpers ---

    /// Bytes the engine delivered to this socket.
    pub fn delivered_to(&self, socket: SocketId) -> &[u8] {
        self.sockets
            .get(&socket)
            .map(|s| s.delivered.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the socket is still open from the host's point of view.
    pub fn is_open(&self, socket: SocketId) -> bool {
        self.sockets.get(&socket).map(|s| s.open).unwrap_or(false)
    }

    /// Whether reads are currently enabled on the socket.
    pub fn read_enabled(&self, socket: SocketId) -> bool {
        self.sockets
            .get(&socket)
            .map(|s| s.read_enabled)
            .unwrap_or(false)
    }

    /// All sockets the engine opened toward `address`, in creation order.
    pub fn backend_sockets_for(&self, address: SocketAddr) -> Vec<SocketId> {
        let mut ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, s)| s.kind == SocketKind::Backend(address))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Total bytes the engine sent toward `address`, across sockets.
    pub fn bytes_sent_to(&self, address: SocketAddr) -> Vec<u8> {
        let mut out = Vec::new();
        for id in self.backend_sockets_for(address) {
            out.extend_from_slice(self.delivered_to(id));
        }
        out
    }

    /// Complete request frames the engine delivered toward `address`.
    pub fn frames_sent_to(&self, address: SocketAddr) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for id in self.backend_sockets_for(address) {
            let mut buf = self.delivered_to(id).to_vec();
            while let Some(header) = FrameHeader::peek(&buf) {
                let need = header.total_len();
                if buf.len() < need {
                    break;
                }
                frames.push(buf.drain(..need).collect());
            }
        }
        frames
    }

    fn auto_respond(&mut self, socket: SocketId, address: SocketAddr) {
        let Some(behavior) = self.peers.get(&address).copied() else {
            return;
        };
        if !behavior.auto_respond {
            return;
        }
        let mut responses = Vec::new();
        if let Some(s) = self.sockets.get_mut(&socket) {
            while let Some(header) = FrameHeader::peek(&s.srv_rx) {
                let need = header.total_len();
                if s.srv_rx.len() < need {
                    break;
                }
                s.srv_rx.drain(..need);
                let response = FrameHeader {
                    payload_size: 0,
                    ..header
                };
                responses.push(response.encode().to_vec());
            }
        }
        for bytes in responses {
            self.push_timed(
                self.now_ns + behavior.delay_ns,
                IoEvent::Data { socket, bytes },
            );
        }
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIo for SimNet {
    fn now_ns(&self) -> i64 {
        self.now_ns
    }

    fn listen(&mut self, port: u16) -> Result<()> {
        if self.listen_port.is_some() {
            return Err(BallastError::Connection(
                "simulated listener already bound".to_string(),
            ));
        }
        self.listen_port = Some(port);
        Ok(())
    }

    fn connect(&mut self, address: SocketAddr) -> Result<SocketId> {
        let socket = self.alloc_id();
        self.sockets
            .insert(socket, SimSocket::new(SocketKind::Backend(address)));
        let refused = self
            .peers
            .get(&address)
            .map(|p| p.refuse_connect)
            .unwrap_or(true);
        if refused {
            self.ready.push_back(IoEvent::ConnectFailed { socket });
        } else {
            self.ready.push_back(IoEvent::ConnectSucceeded { socket });
        }
        Ok(socket)
    }

    fn send(&mut self, socket: SocketId, bytes: &[u8]) -> isize {
        let (accepted, backend_address) = match self.sockets.get_mut(&socket) {
            Some(s) if s.open => {
                if s.fail_sends {
                    return -1;
                }
                let n = s.send_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
                s.delivered.extend_from_slice(&bytes[..n]);
                let addr = match s.kind {
                    SocketKind::Backend(addr) => {
                        s.srv_rx.extend_from_slice(&bytes[..n]);
                        Some(addr)
                    }
                    SocketKind::Client => None,
                };
                (n, addr)
            }
            _ => return -1,
        };
        if let Some(address) = backend_address {
            self.auto_respond(socket, address);
        }
        accepted as isize
    }

    fn notify_writable(&mut self, socket: SocketId) {
        if let Some(s) = self.sockets.get_mut(&socket) {
            s.writable_requested = true;
        }
    }

    fn set_read_enabled(&mut self, socket: SocketId, enabled: bool) {
        let held = match self.sockets.get_mut(&socket) {
            Some(s) => {
                s.read_enabled = enabled;
                if enabled {
                    std::mem::take(&mut s.held)
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };
        for bytes in held {
            self.ready.push_back(IoEvent::Data { socket, bytes });
        }
    }

    fn close(&mut self, socket: SocketId) {
        if let Some(s) = self.sockets.get_mut(&socket) {
            s.open = false;
            s.held.clear();
        }
        // Pending events for a closed socket are left in the queue; the
        // engine ignores events for sockets it no longer tracks.
    }
}

/// Drains every ready event into the engine.
pub fn pump(engine: &mut ProxyEngine, sim: &mut SimNet) {
    while let Some(event) = sim.pop_event() {
        engine.handle_event(event, sim);
    }
}

/// Pumps and advances time until no ready or timed events remain.
pub fn run_until_quiet(engine: &mut ProxyEngine, sim: &mut SimNet) {
    loop {
        pump(engine, sim);
        match sim.next_due_ns() {
            Some(due) => {
                let dt = (due - sim.now()).max(0);
                sim.advance(dt);
            }
            None => break,
        }
    }
}
