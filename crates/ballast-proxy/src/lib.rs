//! Ballast Proxy Engine
//!
//! The connection-and-request proxying core of ballast, plus the hosts
//! that drive it.
//!
//! # Overview
//!
//! The proxy accepts client TCP connections, reassembles length-prefixed
//! frames from each byte stream, routes every request through a
//! pluggable selector, forwards it over a per-(client, backend)
//! connection (reused when one exists), and relays responses back to the
//! originating client while feeding per-backend metrics (active counts,
//! round-trip times) into selection.
//!
//! # Components
//!
//! - [`engine`] - The single-threaded proxy state machine
//! - [`host`] - The [`host::HostIo`] boundary between the engine and
//!   whatever owns the sockets
//! - [`net`] - Production host: tokio sockets on a current-thread
//!   scheduler
//! - [`sim`] - Test host: deterministic in-memory network with a manual
//!   clock and scripted echo backends
//! - [`stats`] - In-process counters
//!
//! # Example
//!
//! ```no_run
//! use ballast_common::ProxyConfig;
//! use ballast_proxy::engine::ProxyEngine;
//! use ballast_proxy::net::ProxyDriver;
//!
//! # fn main() -> ballast_common::Result<()> {
//! let config = ProxyConfig::from_json(r#"{
//!     "listen_port": 9000,
//!     "algorithm": "lr",
//!     "backends": [{"address": "10.0.0.1:9001"}]
//! }"#)?;
//! let engine = ProxyEngine::new(config)?;
//! let driver = ProxyDriver::new(engine);
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_all()
//!     .build()?;
//! let local = tokio::task::LocalSet::new();
//! local.block_on(&runtime, driver.run(std::future::pending::<()>()))?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod host;
pub mod net;
pub mod sim;
pub mod stats;

pub use engine::ProxyEngine;
pub use host::{HostIo, IoEvent, SocketId};
pub use net::ProxyDriver;
