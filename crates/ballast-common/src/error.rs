use thiserror::Error;

/// Errors shared across the ballast crates.
///
/// Error handling follows a strict containment policy: configuration errors
/// are fatal at startup, everything else is scoped to a single connection.
/// Transient I/O conditions (short writes, would-block) are *not* errors;
/// they are handled by the proxy's back-pressure machinery and never appear
/// here.
#[derive(Error, Debug)]
pub enum BallastError {
    /// Invalid configuration detected before the listener starts.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure to establish or operate a TCP connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A frame that violates the wire protocol (e.g. an absurd declared
    /// payload size). The offending connection is dropped.
    #[error("Frame error: {0}")]
    Frame(String),

    /// A broken internal invariant (missing map entry, unexpected socket
    /// state). The affected connection is dropped; unrelated connections
    /// are never touched.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BallastError>;
