//! The engine: connection index, upgrade entry and callback dispatch.
//!
//! A [`Server`] owns the protocol registry and the index of live
//! connections. The upgrade entry validates the handshake, clones the
//! negotiated protocol prototype and runs the blocking reader loop on the
//! calling thread; the callback entry lets any other thread push a REST
//! request to a connected client and wait for its answer.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, EngineClock, ProcessResult, WireCore};
use crate::envelope::EnvelopeError;
use crate::frame::{FrameStream, TcpWire, WireIo};
use crate::handshake::{validate_upgrade, AcceptResponse, HandshakeError, HttpRequest};
use crate::protocol::{BinaryRestProtocol, JsonRestProtocol, ProtocolRegistry, WsProtocol};
use crate::rest::{self, RestHandler, RestRequest, RestResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why an upgrade attempt fell through to ordinary HTTP handling.
#[derive(Debug)]
pub enum UpgradeError {
    /// Handshake validation failed.
    Handshake(HandshakeError),
    /// None of the offered subprotocol tokens is registered.
    UnknownProtocol {
        /// The tokens the client offered.
        offered: Vec<String>,
    },
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
            Self::UnknownProtocol { offered } => {
                write!(f, "no registered subprotocol among {offered:?}")
            }
        }
    }
}

impl std::error::Error for UpgradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handshake(e) => Some(e),
            Self::UnknownProtocol { .. } => None,
        }
    }
}

impl From<HandshakeError> for UpgradeError {
    fn from(err: HandshakeError) -> Self {
        Self::Handshake(err)
    }
}

/// A validated upgrade, ready to take over a socket.
pub struct PendingUpgrade {
    accept: AcceptResponse,
    protocol: Box<dyn WsProtocol>,
}

impl fmt::Debug for PendingUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpgrade")
            .field("accept", &self.accept)
            .field("protocol", &self.protocol.name())
            .finish()
    }
}

impl PendingUpgrade {
    /// The negotiated subprotocol token.
    #[must_use]
    pub fn protocol_name(&self) -> &str {
        self.protocol.name()
    }

    /// The 101 response that will be sent.
    #[must_use]
    pub fn accept(&self) -> &AcceptResponse {
        &self.accept
    }
}

/// Why a callback returned 404. Internal; surfaced only through logs.
enum CallbackFailure {
    UnknownConnection,
    UnsupportedProtocol,
    AcquireTimeout,
    DrainFailed,
    ConnectionClosed,
    Transport,
    AnswerTimeout,
    Envelope(EnvelopeError),
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConnection => write!(f, "unknown connection"),
            Self::UnsupportedProtocol => write!(f, "subprotocol has no REST envelope"),
            Self::AcquireTimeout => write!(f, "could not seize the wire in time"),
            Self::DrainFailed => write!(f, "error while draining inbound requests"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Transport => write!(f, "transport failure"),
            Self::AnswerTimeout => write!(f, "no answer frame in time"),
            Self::Envelope(e) => write!(f, "envelope error: {e}"),
        }
    }
}

/// The bidirectional WebSocket REST engine.
pub struct Server {
    config: ServerConfig,
    registry: Mutex<ProtocolRegistry>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    handler: Arc<dyn RestHandler>,
    clock: EngineClock,
    terminated: AtomicBool,
}

impl Server {
    /// Build a server. The registry always exists; configuration only
    /// decides which prototypes it starts with: the binary subprotocol is
    /// always registered (keyed when `encryption_key` is non-empty), the
    /// JSON one when `enable_json` is set.
    #[must_use]
    pub fn new(config: ServerConfig, handler: Arc<dyn RestHandler>) -> Arc<Self> {
        let mut registry = ProtocolRegistry::new();
        registry.add(Box::new(BinaryRestProtocol::with_encryption(
            &config.encryption_key,
            &config.encryption_key,
            config.compressed,
        )));
        if config.enable_json {
            registry.add(Box::new(JsonRestProtocol::new()));
        }

        Arc::new(Self {
            config,
            registry: Mutex::new(registry),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler,
            clock: EngineClock::new(),
            terminated: AtomicBool::new(false),
        })
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register an additional protocol prototype. False if the name is
    /// taken.
    pub fn add_protocol(&self, protocol: Box<dyn WsProtocol>) -> bool {
        self.registry.lock().add(protocol)
    }

    /// Remove a protocol prototype by name.
    pub fn remove_protocol(&self, name: &str) -> bool {
        self.registry.lock().remove(name)
    }

    /// Ask every reader loop to exit at its next iteration.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether the server has been told to stop.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Identities of the currently registered connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Look up a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Validate an upgrade request against the handshake rules and the
    /// registry. On error the caller falls through to plain HTTP.
    pub fn prepare_upgrade(&self, request: &HttpRequest) -> Result<PendingUpgrade, UpgradeError> {
        let offer = validate_upgrade(request)?;
        let protocol = self
            .registry
            .lock()
            .select(offer.offered_protocols.iter().map(String::as_str))
            .ok_or_else(|| UpgradeError::UnknownProtocol {
                offered: offer.offered_protocols.clone(),
            })?;
        Ok(PendingUpgrade {
            accept: AcceptResponse::new(&offer, protocol.name()),
            protocol,
        })
    }

    /// Send the 101 response, register the connection and run its reader
    /// loop on the calling thread until close or termination.
    pub fn run_upgraded(
        self: &Arc<Self>,
        pending: PendingUpgrade,
        mut wire: Box<dyn WireIo + Send>,
    ) -> io::Result<()> {
        wire.send(&pending.accept.response_bytes())?;
        wire.flush()?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let connection = Arc::new(Connection::new(
            id,
            pending.protocol,
            FrameStream::new(wire),
            &self.clock,
        ));
        self.connections.lock().insert(id, Arc::clone(&connection));
        tracing::debug!(
            connection = %id,
            protocol = %connection.protocol_name(),
            "websocket connection upgraded"
        );

        connection.run_loop(self.handler.as_ref(), &self.clock, &self.terminated);

        // Teardown fence: the index entry goes away only after the last
        // in-flight acquisition attempt has resolved.
        connection.terminate();
        connection.drain_acquirers();
        self.connections.lock().remove(&id);
        tracing::debug!(connection = %id, "websocket connection closed");
        Ok(())
    }

    /// Upgrade a TCP stream and serve it on the calling thread.
    pub fn run_upgraded_tcp(
        self: &Arc<Self>,
        pending: PendingUpgrade,
        stream: std::net::TcpStream,
    ) -> io::Result<()> {
        self.run_upgraded(pending, Box::new(TcpWire::new(stream)))
    }

    /// Push a REST request to a connected client and wait for its answer.
    ///
    /// Callable from any thread. Seizes the target connection's wire within
    /// the configured acquire timeout, drains any pending inbound requests,
    /// sends the request and waits for the answer frame. Every failure maps
    /// to a 404 response; the transport is only torn down on actual
    /// transport errors, never on a mere answer timeout.
    pub fn callback(&self, target: ConnectionId, request: &RestRequest) -> RestResponse {
        match self.try_callback(target, request) {
            Ok(response) => response,
            Err(reason) => {
                tracing::debug!(connection = %target, %reason, "callback failed");
                RestResponse::status(404)
            }
        }
    }

    fn try_callback(
        &self,
        target: ConnectionId,
        request: &RestRequest,
    ) -> Result<RestResponse, CallbackFailure> {
        let connection = self
            .connection(target)
            .ok_or(CallbackFailure::UnknownConnection)?;

        let acquire_timeout = Duration::from_millis(self.config.callback_acquire_timeout_ms);
        let answer_timeout = Duration::from_millis(self.config.callback_answer_timeout_ms);

        let mut core = connection
            .try_acquire(acquire_timeout)
            .ok_or(CallbackFailure::AcquireTimeout)?;
        if core.protocol.envelope().is_none() {
            return Err(CallbackFailure::UnsupportedProtocol);
        }

        // Drain-before-inject: client-initiated requests that are already
        // on the socket are processed before our outbound request touches
        // the wire.
        loop {
            if connection.is_terminated() {
                return Err(CallbackFailure::ConnectionClosed);
            }
            match connection.process_locked(&mut core, self.handler.as_ref(), &self.clock) {
                ProcessResult::Idle => break,
                ProcessResult::Done => {}
                ProcessResult::Error => return Err(CallbackFailure::DrainFailed),
                ProcessResult::Closed => return Err(CallbackFailure::ConnectionClosed),
            }
        }

        // The wire is exclusively ours until the guard drops.
        let WireCore { stream, protocol } = &mut *core;
        let envelope = protocol
            .envelope()
            .ok_or(CallbackFailure::UnsupportedProtocol)?;

        let frame =
            rest::request_to_frame(envelope, request).map_err(CallbackFailure::Envelope)?;
        if stream.send_frame(&frame).is_err() {
            connection.terminate();
            return Err(CallbackFailure::Transport);
        }

        let answer = match stream.get_frame(answer_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(CallbackFailure::AnswerTimeout),
            Err(_) => {
                connection.terminate();
                return Err(CallbackFailure::Transport);
            }
        };

        connection.touch(&self.clock);
        let response =
            rest::frame_to_answer(envelope, &answer).map_err(CallbackFailure::Envelope)?;
        drop(core);

        tracing::trace!(
            connection = %target,
            status = response.status,
            "callback round trip complete"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatProtocol, PROTOCOL_BINARY, PROTOCOL_JSON};

    struct NotFoundHandler;

    impl RestHandler for NotFoundHandler {
        fn handle(&self, _request: &RestRequest) -> RestResponse {
            RestResponse::status(404)
        }
    }

    fn server(config: ServerConfig) -> Arc<Server> {
        Server::new(config, Arc::new(NotFoundHandler))
    }

    fn upgrade_request(protocols: &str) -> HttpRequest {
        let raw = format!(
            "GET /ws HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Protocol: {protocols}\r\n\r\n"
        );
        HttpRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_registry_always_has_binary() {
        let server = server(ServerConfig::default());
        let pending = server
            .prepare_upgrade(&upgrade_request(PROTOCOL_BINARY))
            .unwrap();
        assert_eq!(pending.protocol_name(), PROTOCOL_BINARY);
    }

    #[test]
    fn test_json_requires_opt_in() {
        let server_default = server(ServerConfig::default());
        let err = server_default
            .prepare_upgrade(&upgrade_request(PROTOCOL_JSON))
            .unwrap_err();
        assert!(matches!(err, UpgradeError::UnknownProtocol { .. }));

        let server_json = server(ServerConfig::default().enable_json(true));
        let pending = server_json
            .prepare_upgrade(&upgrade_request(PROTOCOL_JSON))
            .unwrap();
        assert_eq!(pending.protocol_name(), PROTOCOL_JSON);
    }

    #[test]
    fn test_negotiation_takes_first_registered_offer() {
        // JSON offered first but not registered: binary wins.
        let server = server(ServerConfig::default());
        let pending = server
            .prepare_upgrade(&upgrade_request("synopsejson, synopsebinary"))
            .unwrap();
        assert_eq!(pending.protocol_name(), PROTOCOL_BINARY);
        assert_eq!(
            pending.accept().accept_key,
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_upgrade_falls_through_on_bad_handshake() {
        let server = server(ServerConfig::default());
        let raw = b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        let err = server.prepare_upgrade(&request).unwrap_err();
        assert!(matches!(err, UpgradeError::Handshake(_)));
    }

    #[test]
    fn test_add_remove_protocol() {
        let server = server(ServerConfig::default());
        assert!(server.add_protocol(Box::new(ChatProtocol::new("chat"))));
        assert!(!server.add_protocol(Box::new(ChatProtocol::new("CHAT"))));
        assert!(server.remove_protocol("Chat"));
        assert!(!server.remove_protocol("chat"));
    }

    #[test]
    fn test_callback_unknown_connection_is_404() {
        let server = server(ServerConfig::default());
        let response = server.callback(ConnectionId(42), &RestRequest::get("/nowhere"));
        assert_eq!(response.status, 404);
        // No connection was harmed.
        assert_eq!(server.connection_count(), 0);
    }
}
