//! Error types for ipbus-client.

use thiserror::Error;

/// Propagation class of an error.
///
/// Each class implies a different recovery policy at the exchange-engine
/// level:
///
/// - [`ErrorKind::Network`] - the wire itself failed; the target is marked
///   disconnected and the caller must reconnect.
/// - [`ErrorKind::Ipbus`] - the wire is fine but the target answered with a
///   protocol violation or a per-transaction fault; the target stays online.
/// - [`ErrorKind::Logic`] - the builder API was misused by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket failure, short write, or a malformed/missing datagram.
    Network,
    /// Protocol-level failure reported by or detected in a response.
    Ipbus,
    /// Caller misuse of the packet-builder API.
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "Network error"),
            ErrorKind::Ipbus => write!(f, "IPbus error"),
            ErrorKind::Logic => write!(f, "Logic error"),
        }
    }
}

/// Main error type for all ipbus-client operations.
#[derive(Debug, Error)]
pub enum IpbusError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket accepted fewer bytes than the request holds.
    #[error("sending packet failed: {written}/{expected} bytes written")]
    ShortWrite {
        /// Bytes the socket reported as written.
        written: usize,
        /// Bytes the request datagram holds.
        expected: usize,
    },

    /// No datagram arrived within the exchange timeout.
    #[error("no response: {0}")]
    NoResponse(String),

    /// The target is not online; nothing was sent.
    #[error("target is offline")]
    TargetOffline,

    /// A datagram arrived but was rejected before validation.
    #[error("network error: {0}")]
    Network(String),

    /// Appending the transaction would exceed the MTU word cap.
    #[error("packet size exceeded")]
    PacketOverflow,

    /// Response validation failed (header mismatch, truncation, fault code).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Builder API misuse (bad word count, undersized destination, ...).
    #[error("logic error: {0}")]
    Logic(String),
}

impl IpbusError {
    /// The propagation class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpbusError::Io(_)
            | IpbusError::ShortWrite { .. }
            | IpbusError::NoResponse(_)
            | IpbusError::TargetOffline
            | IpbusError::Network(_) => ErrorKind::Network,
            IpbusError::PacketOverflow | IpbusError::Protocol(_) => ErrorKind::Ipbus,
            IpbusError::Logic(_) => ErrorKind::Logic,
        }
    }
}

/// Result type alias using IpbusError.
pub type Result<T> = std::result::Result<T, IpbusError>;
