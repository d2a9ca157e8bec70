//! Error types for setup and wire decoding.

use thiserror::Error;

/// Errors raised before the event loop runs. All of them are fatal:
/// `main` logs the message and exits with status 1.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Malformed or incomplete configuration file
    #[error("CONFIG ERROR: {0}")]
    Config(String),
    /// Socket, TUN, privilege or shell-command failure during bring-up
    #[error("STARTUP ERROR: {0}")]
    Startup(String),
    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced while decoding ZPRN entries off the wire.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Entry extends past the end of the buffer
    #[error("truncated entry")]
    Truncated,
    /// Address-type field is neither 4 nor 6
    #[error("unsupported address type {0}")]
    BadAddrType(u16),
}
