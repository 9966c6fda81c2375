//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Sealed packet is structurally invalid (too short to hold timestamp and signature).
    #[error("malformed sealed packet: {0}")]
    MalformedPacket(String),

    /// Sealed packet timestamp is outside the accepted skew window.
    #[error("stale message: timestamp {timestamp} differs from now {now} by more than {max_skew}s")]
    StaleMessage {
        /// Timestamp carried by the packet.
        timestamp: u64,
        /// Verifier's wall clock.
        now: u64,
        /// Accepted skew in seconds.
        max_skew: u64,
    },

    // Frame errors
    /// Frame is shorter than the minimum envelope.
    #[error("frame too short: {size} bytes, need at least {min}")]
    FrameTooShort {
        /// Actual frame size.
        size: usize,
        /// Minimum accepted size.
        min: usize,
    },

    // Key directory errors
    /// No keys are known for the given peer.
    #[error("unknown peer: {peer_id}")]
    UnknownPeer {
        /// The peer identifier that has no key entry.
        peer_id: u32,
    },

    /// A numeric identifier does not fit its wire width.
    #[error("value {value} out of range for {field}")]
    OutOfRange {
        /// Name of the field being converted.
        field: &'static str,
        /// Offending value.
        value: i128,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<chacha20poly1305::Error> for ProtocolError {
    fn from(_: chacha20poly1305::Error) -> Self {
        // aead::Error carries no detail; tag mismatch is the only failure mode.
        ProtocolError::Decryption("authentication tag mismatch".to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
