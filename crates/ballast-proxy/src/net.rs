//! Tokio-backed host driver.
//!
//! Translates real socket readiness into [`IoEvent`]s and executes the
//! engine's [`HostIo`] calls over non-blocking `try_read`/`try_write`.
//! Everything runs on a single scheduler: the driver must be polled inside
//! a [`tokio::task::LocalSet`] on a current-thread runtime, so all state
//! for one listener stays on one thread and handlers never race.
//!
//! Per-socket watcher tasks feed an unbounded channel; the driver's run
//! loop owns the engine and applies events in arrival order.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use ballast_common::{BallastError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ProxyEngine;
use crate::host::{HostIo, IoEvent, SocketId};

const READ_CHUNK: usize = 16 * 1024;

struct SocketEntry {
    stream: Rc<TcpStream>,
    read_enabled: Rc<Cell<bool>>,
    read_gate: Rc<Notify>,
    reader: JoinHandle<()>,
    waiters: Vec<JoinHandle<()>>,
}

type SocketMap = Rc<RefCell<HashMap<SocketId, SocketEntry>>>;

fn register_stream(
    sockets: &SocketMap,
    events: &UnboundedSender<IoEvent>,
    socket: SocketId,
    stream: TcpStream,
) {
    let stream = Rc::new(stream);
    let read_enabled = Rc::new(Cell::new(true));
    let read_gate = Rc::new(Notify::new());

    let reader = {
        let stream = Rc::clone(&stream);
        let read_enabled = Rc::clone(&read_enabled);
        let read_gate = Rc::clone(&read_gate);
        let events = events.clone();
        tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                while !read_enabled.get() {
                    read_gate.notified().await;
                }
                if stream.readable().await.is_err() {
                    let _ = events.send(IoEvent::Error { socket });
                    break;
                }
                if !read_enabled.get() {
                    continue;
                }
                match stream.try_read(&mut buf) {
                    Ok(0) => {
                        let _ = events.send(IoEvent::Closed { socket });
                        break;
                    }
                    Ok(n) => {
                        let _ = events.send(IoEvent::Data {
                            socket,
                            bytes: buf[..n].to_vec(),
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        debug!(?socket, error = %e, "Read failed");
                        let _ = events.send(IoEvent::Error { socket });
                        break;
                    }
                }
            }
        })
    };

    sockets.borrow_mut().insert(
        socket,
        SocketEntry {
            stream,
            read_enabled,
            read_gate,
            reader,
            waiters: Vec::new(),
        },
    );
}

/// [`HostIo`] over real tokio sockets.
pub struct TokioHost {
    origin: Instant,
    next_id: Rc<Cell<u64>>,
    sockets: SocketMap,
    events: UnboundedSender<IoEvent>,
    listener: Option<JoinHandle<()>>,
}

impl TokioHost {
    pub fn new(events: UnboundedSender<IoEvent>) -> Self {
        Self {
            origin: Instant::now(),
            next_id: Rc::new(Cell::new(1)),
            sockets: Rc::new(RefCell::new(HashMap::new())),
            events,
            listener: None,
        }
    }

    fn alloc_id(next_id: &Rc<Cell<u64>>) -> SocketId {
        let id = next_id.get();
        next_id.set(id + 1);
        SocketId(id)
    }

    /// Aborts every task and drops every socket.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
        for (_, entry) in self.sockets.borrow_mut().drain() {
            entry.reader.abort();
            for waiter in entry.waiters {
                waiter.abort();
            }
        }
    }
}

impl HostIo for TokioHost {
    fn now_ns(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn listen(&mut self, port: u16) -> Result<()> {
        if self.listener.is_some() {
            return Err(BallastError::Connection("listener already bound".to_string()));
        }
        let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| BallastError::Connection(format!("Failed to bind port {}: {}", port, e)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(BallastError::Io)?;
        let listener = TcpListener::from_std(std_listener).map_err(BallastError::Io)?;

        let sockets = Rc::clone(&self.sockets);
        let next_id = Rc::clone(&self.next_id);
        let events = self.events.clone();
        self.listener = Some(tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let socket = Self::alloc_id(&next_id);
                        register_stream(&sockets, &events, socket, stream);
                        let _ = events.send(IoEvent::Accepted { socket, peer });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        }));
        Ok(())
    }

    fn connect(&mut self, address: SocketAddr) -> Result<SocketId> {
        let socket = Self::alloc_id(&self.next_id);
        let sockets = Rc::clone(&self.sockets);
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    register_stream(&sockets, &events, socket, stream);
                    let _ = events.send(IoEvent::ConnectSucceeded { socket });
                }
                Err(e) => {
                    debug!(%address, error = %e, "Connect failed");
                    let _ = events.send(IoEvent::ConnectFailed { socket });
                }
            }
        });
        Ok(socket)
    }

    fn send(&mut self, socket: SocketId, bytes: &[u8]) -> isize {
        let sockets = self.sockets.borrow();
        let Some(entry) = sockets.get(&socket) else {
            return -1;
        };
        match entry.stream.try_write(bytes) {
            Ok(n) => n as isize,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                debug!(?socket, error = %e, "Write failed");
                -1
            }
        }
    }

    fn notify_writable(&mut self, socket: SocketId) {
        let mut sockets = self.sockets.borrow_mut();
        let Some(entry) = sockets.get_mut(&socket) else {
            return;
        };
        let stream = Rc::clone(&entry.stream);
        let events = self.events.clone();
        entry.waiters.push(tokio::task::spawn_local(async move {
            if stream.writable().await.is_ok() {
                let _ = events.send(IoEvent::Writable {
                    socket,
                    available: usize::MAX,
                });
            }
        }));
    }

    fn set_read_enabled(&mut self, socket: SocketId, enabled: bool) {
        let sockets = self.sockets.borrow();
        if let Some(entry) = sockets.get(&socket) {
            entry.read_enabled.set(enabled);
            if enabled {
                entry.read_gate.notify_one();
            }
        }
    }

    fn close(&mut self, socket: SocketId) {
        if let Some(entry) = self.sockets.borrow_mut().remove(&socket) {
            entry.reader.abort();
            for waiter in entry.waiters {
                waiter.abort();
            }
        }
    }
}

/// Owns an engine and a [`TokioHost`] and runs the event loop.
pub struct ProxyDriver {
    engine: ProxyEngine,
    host: TokioHost,
    events: UnboundedReceiver<IoEvent>,
}

impl ProxyDriver {
    pub fn new(engine: ProxyEngine) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            engine,
            host: TokioHost::new(tx),
            events: rx,
        }
    }

    /// Runs the proxy until `shutdown` resolves.
    ///
    /// Must be polled inside a [`tokio::task::LocalSet`] on a
    /// current-thread runtime.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.engine.start(&mut self.host)?;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                maybe_event = self.events.recv() => match maybe_event {
                    Some(event) => self.engine.handle_event(event, &mut self.host),
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
        self.engine.stop(&mut self.host);
        self.host.shutdown();
        Ok(())
    }
}
