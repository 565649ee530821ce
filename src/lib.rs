//! Bidisync: a bidirectional WebSocket REST engine.
//!
//! # Overview
//!
//! Bidisync upgrades ordinary HTTP connections and thereafter carries a
//! REST-shaped request/response protocol in *both* directions over the same
//! socket. A blocking reader thread owns each connection; a
//! server-initiated callback briefly seizes the wire, drains any pending
//! inbound request, then performs its own round trip. There is no event
//! loop.
//!
//! # Core Guarantees
//!
//! - **Mutual exclusion**: only the holder of a connection's acquire lock
//!   reads or writes the socket; two request/response exchanges never
//!   interleave on one wire
//! - **Drain-before-inject**: a callback processes every pending inbound
//!   request before its own request frame is emitted, so client-initiated
//!   requests are never reordered against an earlier callback
//! - **Per-connection ordering**: responses leave in the order their
//!   requests arrived
//! - **Bounded frames**: a frame announcing more than 128 MiB is rejected
//!   before any payload byte is read
//!
//! # Module Structure
//!
//! - [`frame`]: RFC 6455 frame codec over a blocking byte stream
//! - [`handshake`]: HTTP upgrade validation and the accept hash
//! - [`envelope`]: the JSON and binary REST envelope encodings
//! - [`protocol`]: subprotocol variants and the prototype registry
//! - [`rest`]: the REST message model and the host handler seam
//! - [`connection`]: per-connection state machine and reader loop
//! - [`server`]: connection index, upgrade entry, callback dispatch
//! - [`listener`]: blocking HTTP front end
//! - [`config`]: server configuration
//! - [`error`]: crate-level error aggregation
//!
//! # Example
//!
//! ```no_run
//! use bidisync::{listener, RestRequest, RestResponse, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! let config = ServerConfig::new(8888).enable_json(true);
//! let server = Server::new(
//!     config,
//!     Arc::new(|request: &RestRequest| RestResponse {
//!         status: 200,
//!         content_type: "text/plain".to_string(),
//!         content: format!("hello from {}", request.url).into_bytes(),
//!         ..RestResponse::default()
//!     }),
//! );
//! let handle = listener::serve(server).expect("bind");
//!
//! // From any thread: push a request to a connected client.
//! for id in handle.server().connection_ids() {
//!     let answer = handle.server().callback(id, &RestRequest::get("/notify"));
//!     println!("client {id} answered {}", answer.status);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod protocol;
pub mod rest;
pub mod server;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ProcessResult};
pub use envelope::{EnvelopeError, FrameEnvelope};
pub use error::{EngineError, Result};
pub use frame::{Frame, FrameError, FrameStream, Opcode, TcpWire, WireIo};
pub use handshake::{compute_accept_key, HandshakeError, HttpRequest};
pub use protocol::{
    BinaryRestProtocol, ChatProtocol, JsonRestProtocol, ProtocolRegistry, WsProtocol,
    PROTOCOL_BINARY, PROTOCOL_JSON,
};
pub use rest::{RestHandler, RestRequest, RestResponse};
pub use server::{PendingUpgrade, Server, UpgradeError};
