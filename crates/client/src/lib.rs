//! # Pulse Client Library
//!
//! A reconnecting, encrypted request/response channel between participants
//! of a Pulse relay.
//!
//! ## Overview
//!
//! The client keeps one WebSocket session to the relay alive and layers a
//! small request/response protocol on top of it:
//!
//! - **Connection Manager**: opens the session, reconnects on a fixed
//!   interval, answers keep-alive pings and reports lifecycle events
//! - **Correlation Tracker**: pairs each query with its answer or a timeout
//! - **Dispatcher**: opens inbound frames and routes them to the tracker or
//!   to the application's handlers
//! - **Configuration**: TOML file with identity, peers and connection settings
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    PulseClient                       │
//! ├──────────────────────────────────────────────────────┤
//! │                                                      │
//! │  ┌──────────────┐  ┌────────────────────────────┐    │
//! │  │ Correlation  │◀─│        Dispatcher          │    │
//! │  │   Tracker    │  │  answers / queries / text  │    │
//! │  └──────────────┘  └────────────────────────────┘    │
//! │                               ▲                      │
//! │  ┌────────────────────────────┴─────────────────┐    │
//! │  │            Connection Manager                │    │
//! │  └──────────────────────────────────────────────┘    │
//! │                               ▲                      │
//! │  ┌────────────────────────────┴─────────────────┐    │
//! │  │      Transport (WebSocket or in-memory)      │    │
//! │  └──────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulse_client::{Config, PulseClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let client = PulseClient::from_config(&config)?;
//!
//!     client.set_on_message(|from, _command, body| async move {
//!         tracing::info!("query from {}: {} bytes", from, body.len());
//!         Some(b"{\"ok\":true}".to_vec())
//!     });
//!
//!     client.connect().await?;
//!     let outcome = client.server_request(&serde_json::json!({"type": "status"})).await?;
//!     println!("{:?}", outcome);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: The client engine
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: Session lifecycle and reconnects
//! - [`correlation`]: Pending requests and timeouts
//! - [`dispatcher`]: Inbound routing
//! - [`transport`]: WebSocket transport and endpoint URLs
//! - `testing`: In-memory transport for tests (`testing` feature)

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

// Re-export protocol for convenience
pub use pulse_protocol as protocol;

pub use client::{ClientOptions, PulseClient};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use correlation::{CorrelationTracker, RequestOutcome, DEFAULT_REQUEST_TIMEOUT};
pub use dispatcher::{Dispatcher, FrameSender, MessageHandler};
pub use error::{ClientError, Result};
pub use transport::{endpoint_url, Role, Transport, WebSocketTransport, WireMessage};
