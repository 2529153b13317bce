//! Ballast Common Types
//!
//! This crate provides the wire format, error type and configuration surface
//! shared by all ballast components.
//!
//! # Overview
//!
//! Ballast is a Layer-7 TCP load balancer: it accepts client connections,
//! reassembles a length-prefixed request/response framing from each byte
//! stream, picks a backend per request and relays responses back to the
//! originating client. This crate contains the pieces every other crate
//! agrees on:
//!
//! - **[`frame`]** - The fixed-size binary frame header and its codec
//! - **[`error`]** - The shared error enum and `Result` alias
//! - **[`config`]** - The configuration structs and their validation
//!
//! # Wire Format
//!
//! Every message on the wire is a 24-byte header followed by an opaque
//! payload:
//!
//! ```text
//! [seq u32][timestamp_ns i64][payload_size u32][l7_id u64][payload...]
//! ```
//!
//! All integers are big-endian. Responses reuse the request header with
//! `payload_size = 0`.

pub mod config;
pub mod error;
pub mod frame;

pub use config::{Algorithm, BackendSpec, ProxyConfig};
pub use error::{BallastError, Result};
pub use frame::{FrameHeader, HEADER_LEN, MAX_FRAME_PAYLOAD};
