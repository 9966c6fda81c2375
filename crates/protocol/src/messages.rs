//! Application-level payloads.
//!
//! Binary frames carry opaque bodies; by convention answers are UTF-8 JSON.
//! Text frames carry a handful of transport control strings and otherwise
//! login traffic from the relay.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Keepalive sent by the relay.
pub const PING: &str = "ping";

/// Keepalive reply.
pub const PONG: &str = "pong";

/// Relay notice for a frame addressed to an offline or unknown peer.
pub const ROUTE_FAILED: &str = "Failed to route";

/// Transport control strings recognised on text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Must be answered with [`ControlMessage::Pong`].
    Ping,
    /// Ignored.
    Pong,
    /// Ignored.
    RouteFailed,
}

impl ControlMessage {
    /// Recognise a control string. Other text is application traffic.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            PING => Some(Self::Ping),
            PONG => Some(Self::Pong),
            ROUTE_FAILED => Some(Self::RouteFailed),
            _ => None,
        }
    }

    /// Returns the wire text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => PING,
            Self::Pong => PONG,
            Self::RouteFailed => ROUTE_FAILED,
        }
    }
}

/// Body of an answer, interpreted as JSON when possible.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Body parsed as JSON.
    Json(Value),
    /// UTF-8 body that is not JSON.
    Text(String),
    /// Body that is not UTF-8.
    Binary(Vec<u8>),
}

impl Reply {
    /// Interpret an answer body.
    pub fn from_body(body: Vec<u8>) -> Self {
        match String::from_utf8(body) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Reply::Json(value),
                Err(_) => Reply::Text(text),
            },
            Err(err) => Reply::Binary(err.into_bytes()),
        }
    }

    /// Returns the JSON value, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Reply::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the text, if the body was UTF-8 but not JSON.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the `error` string of a JSON object reply like `{"error": "..."}`.
    pub fn error_message(&self) -> Option<&str> {
        self.as_json()?.get("error")?.as_str()
    }

    /// Re-encode the reply as bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Json(value) => value.to_string().into_bytes(),
            Reply::Text(text) => text.into_bytes(),
            Reply::Binary(bytes) => bytes,
        }
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Json(value) => write!(f, "{}", value),
            Reply::Text(text) => write!(f, "{}", text),
            Reply::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Serialize a value as a JSON body.
pub fn json_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
