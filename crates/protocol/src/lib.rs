//! # Pulse Protocol Library
//!
//! Wire format, key material and sealing primitives for the Pulse relay
//! protocol.
//!
//! ## Overview
//!
//! Participants exchange binary frames through a relay server. Each frame is
//! addressed to a numeric peer and carries a sealed packet that only the
//! recipient can open. This crate provides:
//!
//! - **Envelope Codec**: outer peer address, inner correlation id and command
//! - **Sealing Suite**: X25519 agreement, XChaCha20-Poly1305, Ed25519 signatures
//! - **Key Directory**: shared map from peer id to public keys
//! - **Replies**: answer bodies interpreted as JSON, text or bytes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Application body (JSON)           │
//! ├─────────────────────────────────────────┤
//! │  Inner message: id u16 | cmd u8 | body  │
//! ├─────────────────────────────────────────┤
//! │  Sealed packet: ts | ciphertext | sig   │  XChaCha20-Poly1305 + Ed25519
//! ├─────────────────────────────────────────┤
//! │  Outer frame: peer u32 | sealed packet  │
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use pulse_protocol::{Command, CorrelationId, EnvelopeCodec, KeyDirectory, LocalIdentity, PeerId};
//!
//! let alice = LocalIdentity::generate();
//! let bob = LocalIdentity::generate();
//!
//! let keys = Arc::new(KeyDirectory::new());
//! keys.insert(PeerId(2), bob.public_keys());
//!
//! let codec = EnvelopeCodec::new(alice, keys);
//! let frame = codec
//!     .encode(PeerId(2), Command::Query, CorrelationId(1), b"{}", pulse_protocol::unix_now())
//!     .unwrap();
//! assert_eq!(&frame[..4], &[2, 0, 0, 0]);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Sealing suite, identities and key parsing
//! - [`envelope`]: Frame codec and identifiers
//! - [`keys`]: Key directory
//! - [`messages`]: Replies and control strings
//! - [`error`]: Error types

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod messages;

pub use crypto::{
    parse_key, random_seed, unix_now, Crypto25519, LocalIdentity, PeerKeys, PeerKeysText,
    SealingSuite, Seed, KEY_LENGTH, SEAL_OVERHEAD,
};
pub use envelope::{
    Command, CorrelationId, EnvelopeCodec, Inbound, InnerMessage, PeerId, ADDRESS_LENGTH,
    DEFAULT_MAX_SKEW_SECS, MIN_FRAME_LENGTH, MIN_INNER_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use keys::KeyDirectory;
pub use messages::{json_body, ControlMessage, Reply, PING, PONG, ROUTE_FAILED};
