//! Binary frame format exchanged with the relay.
//!
//! # Wire Format
//!
//! ```text
//! outer frame (binary websocket message):
//! ┌──────────────┬─────────────────────────────┐
//! │ peer (4, LE) │ sealed packet (variable)    │
//! └──────────────┴─────────────────────────────┘
//!
//! inner message (sealed packet plaintext):
//! ┌────────────┬─────────┬──────────────────────┐
//! │ id (2, LE) │ cmd (1) │ body (variable)      │
//! └────────────┴─────────┴──────────────────────┘
//! ```
//!
//! Outbound the peer field names the recipient; the relay rewrites it to the
//! sender before delivery, so inbound it names the sender.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{Crypto25519, LocalIdentity, SealingSuite};
use crate::error::{ProtocolError, Result};
use crate::keys::KeyDirectory;

/// Size of the peer address prefix.
pub const ADDRESS_LENGTH: usize = 4;

/// Size of the inner header (correlation id + command).
pub const INNER_HEADER_LENGTH: usize = 3;

/// Smallest outer frame that can be decoded.
pub const MIN_FRAME_LENGTH: usize = ADDRESS_LENGTH + 1;

/// Smallest decrypted inner message that is dispatched.
pub const MIN_INNER_LENGTH: usize = INNER_HEADER_LENGTH + 1;

/// Default accepted clock skew for inbound frames, in seconds.
pub const DEFAULT_MAX_SKEW_SECS: u64 = 5;

/// Numeric identity of a participant. `0` is the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The relay server.
    pub const SERVER: PeerId = PeerId(0);

    /// Returns the raw identifier.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns true for the relay server address.
    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        PeerId(id)
    }
}

impl TryFrom<i64> for PeerId {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self> {
        u32::try_from(value)
            .map(PeerId)
            .map_err(|_| ProtocolError::OutOfRange {
                field: "peer id",
                value: value.into(),
            })
    }
}

impl TryFrom<u64> for PeerId {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self> {
        u32::try_from(value)
            .map(PeerId)
            .map_err(|_| ProtocolError::OutOfRange {
                field: "peer id",
                value: value.into(),
            })
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit tag pairing a query with its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u16);

impl CorrelationId {
    /// Returns the raw identifier.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Next identifier, wrapping from 65535 to 0.
    pub fn wrapping_next(self) -> Self {
        CorrelationId(self.0.wrapping_add(1))
    }
}

impl From<u16> for CorrelationId {
    fn from(id: u16) -> Self {
        CorrelationId(id)
    }
}

impl TryFrom<i64> for CorrelationId {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self> {
        u16::try_from(value)
            .map(CorrelationId)
            .map_err(|_| ProtocolError::OutOfRange {
                field: "correlation id",
                value: value.into(),
            })
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command byte of an inner message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `0x00`: expects an answer carrying the same correlation id.
    Query,
    /// `0x01`: answer to an earlier query.
    Answer,
    /// Any other code, delivered to the message handler without a reply.
    Other(u8),
}

impl Command {
    /// Wire code of [`Command::Query`].
    pub const QUERY_CODE: u8 = 0x00;
    /// Wire code of [`Command::Answer`].
    pub const ANSWER_CODE: u8 = 0x01;

    /// Returns the wire byte.
    pub fn code(self) -> u8 {
        u8::from(self)
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            Self::QUERY_CODE => Command::Query,
            Self::ANSWER_CODE => Command::Answer,
            other => Command::Other(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        match command {
            Command::Query => Command::QUERY_CODE,
            Command::Answer => Command::ANSWER_CODE,
            Command::Other(code) => code,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Query => write!(f, "query"),
            Command::Answer => write!(f, "answer"),
            Command::Other(code) => write!(f, "0x{:02x}", code),
        }
    }
}

/// Decrypted content of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    /// Correlation id, echoed by answers.
    pub correlation_id: CorrelationId,
    /// Command byte.
    pub command: Command,
    /// Application payload.
    pub body: Vec<u8>,
}

impl InnerMessage {
    /// Create a new inner message.
    pub fn new(correlation_id: CorrelationId, command: Command, body: Vec<u8>) -> Self {
        Self {
            correlation_id,
            command,
            body,
        }
    }

    /// Serialize as `[id LE][cmd][body]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INNER_HEADER_LENGTH + self.body.len());
        out.extend_from_slice(&self.correlation_id.0.to_le_bytes());
        out.push(self.command.code());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a decrypted inner message.
    ///
    /// Messages without at least one body byte are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_INNER_LENGTH {
            return Err(ProtocolError::FrameTooShort {
                size: data.len(),
                min: MIN_INNER_LENGTH,
            });
        }

        Ok(Self {
            correlation_id: CorrelationId(u16::from_le_bytes([data[0], data[1]])),
            command: Command::from(data[2]),
            body: data[INNER_HEADER_LENGTH..].to_vec(),
        })
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Sender, as rewritten by the relay.
    pub from: PeerId,
    /// Decrypted message.
    pub message: InnerMessage,
}

/// Seals inner messages into outer frames and opens inbound frames.
///
/// The codec holds the local identity and a shared handle to the key
/// directory. It never mutates the directory.
#[derive(Clone)]
pub struct EnvelopeCodec {
    identity: Arc<LocalIdentity>,
    keys: Arc<KeyDirectory>,
    suite: Arc<dyn SealingSuite>,
    max_skew_secs: u64,
}

impl EnvelopeCodec {
    /// Create a codec using the default [`Crypto25519`] suite.
    pub fn new(identity: LocalIdentity, keys: Arc<KeyDirectory>) -> Self {
        Self {
            identity: Arc::new(identity),
            keys,
            suite: Arc::new(Crypto25519),
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }

    /// Replace the sealing suite.
    pub fn with_suite(mut self, suite: Arc<dyn SealingSuite>) -> Self {
        self.suite = suite;
        self
    }

    /// Set the accepted clock skew. Zero disables the freshness check.
    pub fn with_max_skew(mut self, max_skew_secs: u64) -> Self {
        self.max_skew_secs = max_skew_secs;
        self
    }

    /// Returns the local identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Returns the key directory.
    pub fn keys(&self) -> &Arc<KeyDirectory> {
        &self.keys
    }

    /// Returns the accepted clock skew in seconds.
    pub fn max_skew_secs(&self) -> u64 {
        self.max_skew_secs
    }

    /// Build an outbound frame addressed to `to`.
    ///
    /// Fails with [`ProtocolError::UnknownPeer`] when the directory has no
    /// keys for the recipient. No partial frame is ever produced.
    pub fn encode(
        &self,
        to: PeerId,
        command: Command,
        correlation_id: CorrelationId,
        body: &[u8],
        now: u64,
    ) -> Result<Vec<u8>> {
        let peer = self.keys.require(to)?;

        let inner = InnerMessage {
            correlation_id,
            command,
            body: body.to_vec(),
        };
        let sealed = self.suite.encrypt_and_sign(
            &inner.to_bytes(),
            self.identity.exchange_secret(),
            self.identity.signing_key(),
            &peer.exchange,
            now,
        )?;

        let mut frame = Vec::with_capacity(ADDRESS_LENGTH + sealed.len());
        frame.extend_from_slice(&to.0.to_le_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open an inbound frame.
    ///
    /// Every failure is reported as an error value: short frames, unknown
    /// senders, bad signatures, stale timestamps, decryption failures and
    /// inner messages without a body.
    pub fn decode(&self, raw: &[u8], now: u64) -> Result<Inbound> {
        if raw.len() < MIN_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooShort {
                size: raw.len(),
                min: MIN_FRAME_LENGTH,
            });
        }

        let (address, sealed) = raw.split_at(ADDRESS_LENGTH);
        let from = PeerId(u32::from_le_bytes([
            address[0], address[1], address[2], address[3],
        ]));
        let peer = self.keys.require(from)?;

        let plaintext = self.suite.verify_and_decrypt(
            sealed,
            self.identity.exchange_secret(),
            &peer.exchange,
            &peer.signing,
            self.max_skew_secs,
            now,
        )?;

        Ok(Inbound {
            from,
            message: InnerMessage::from_bytes(&plaintext)?,
        })
    }
}

impl fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("identity", &self.identity)
            .field("peers", &self.keys.len())
            .field("max_skew_secs", &self.max_skew_secs)
            .finish()
    }
}
