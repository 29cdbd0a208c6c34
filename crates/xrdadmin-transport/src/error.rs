//! Transport error type.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors raised below the request/reply boundary: connecting, framing,
/// encoding and waiting for replies.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer refused the connection or is known to be down.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Peer address
        addr: String,
    },

    /// Connecting did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Peer address
        addr: String,
        /// Configured connect timeout
        timeout_ms: u64,
    },

    /// The peer closed the connection mid-exchange.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame failed structural validation.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with it
        reason: String,
    },

    /// Frame magic did not match.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic
        expected: u32,
        /// Received magic
        got: u32,
    },

    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version
        expected: u8,
        /// Peer version
        got: u8,
    },

    /// Payload CRC did not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// Payload exceeds the protocol limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced size
        size: u32,
        /// Protocol limit
        max_size: u32,
    },

    /// No reply arrived within the per-attempt timeout.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Request id of the attempt
        request_id: u64,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Opcode not known to this implementation.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// A reply did not correlate with the outstanding request.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// What the session waited for
        expected: String,
        /// What arrived
        got: String,
    },

    /// The server rejected the session login.
    #[error("login to {addr} rejected: {message}")]
    LoginRejected {
        /// Server address
        addr: String,
        /// Server-provided reason
        message: String,
    },

    /// A server address could not be parsed.
    #[error("invalid server address '{addr}'")]
    InvalidAddress {
        /// The rejected text
        addr: String,
    },

    /// The session or pool is closed.
    #[error("not connected")]
    NotConnected,

    /// Message body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The caller cancelled the exchange.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why
        reason: CancelReason,
    },

    /// Underlying socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
