//! Error types for the connection multiplexer.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the mux to its error handler and to route listeners.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No registered route accepted the connection. The connection has been
    /// closed.
    #[error("mux: connection {remote} not matched by any matcher")]
    NotMatched { remote: SocketAddr },

    /// The mux stopped serving; route listeners return this from `accept`.
    #[error("mux: listener closed")]
    ListenerClosed,

    /// The root listener failed to accept.
    #[error("mux: accept failed: {0}")]
    Accept(#[source] io::Error),

    /// A PROXY header at the start of the connection could not be parsed.
    #[error("mux: invalid proxy header from {remote}: {source}")]
    ProxyHeader {
        remote: SocketAddr,
        #[source]
        source: ProxyHeaderError,
    },
}

impl MuxError {
    /// Whether serving may continue after this error, before the error
    /// handler's own verdict is taken into account.
    ///
    /// Per-connection failures are temporary. Accept failures are temporary
    /// only when the transport marks them so.
    pub fn is_temporary(&self) -> bool {
        match self {
            MuxError::NotMatched { .. } | MuxError::ProxyHeader { .. } => true,
            MuxError::Accept(err) => is_temporary_io(err),
            MuxError::ListenerClosed => false,
        }
    }

    /// Whether this error concerns a single connection rather than the
    /// root listener.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MuxError::NotMatched { .. } | MuxError::ProxyHeader { .. }
        )
    }
}

/// Too many open files, process-wide and system-wide.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Classify an accept error as transient.
///
/// Peer-side aborts, interrupted calls and descriptor exhaustion clear up on
/// their own; anything else means the listener itself is unusable.
pub fn is_temporary_io(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => cfg!(unix) && matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE)),
    }
}

/// Errors from PROXY header parsing.
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    /// The v1 line does not have the expected shape.
    #[error("invalid header line: {0}")]
    InvalidLine(String),

    /// The v1 address family is not `TCP4`, `TCP6` or `UNKNOWN`.
    #[error("unhandled address type: {0}")]
    UnknownFamily(String),

    /// An address field is not a valid IP literal for the family.
    #[error("invalid ip address: {0}")]
    InvalidAddress(String),

    /// A port field is not a decimal number in 0..=65535.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// The v2 version/command byte is not supported.
    #[error("unsupported proxy v2 version/command: {0:#04x}")]
    UnsupportedVersion(u8),

    /// The header did not end within the allowed number of bytes.
    #[error("header exceeds {limit} bytes")]
    TooLong { limit: usize },

    /// The stream ended, or the address block was cut short, mid-header.
    #[error("truncated header")]
    Truncated,

    /// Reading the header failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}
