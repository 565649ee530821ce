//! HTTP upgrade handshake (RFC 6455 Section 4), server side.
//!
//! The engine upgrades an ordinary HTTP/1.1 GET into a WebSocket session
//! when the request carries:
//!
//! ```http
//! GET /endpoint HTTP/1.1
//! Connection: Upgrade
//! Upgrade: websocket
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Protocol: synopsebinary
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! ```
//!
//! and answers:
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! Sec-WebSocket-Protocol: synopsebinary
//! ```
//!
//! A request that fails validation is not an error for the transport: the
//! caller falls through to ordinary HTTP handling.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the Sec-WebSocket-Accept value from a client key.
///
/// SHA-1 over the raw concatenated `key + GUID` bytes, base64-encoded. No
/// trailing NUL, no encoding normalization.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Handshake validation errors.
///
/// None of these tear anything down; the upgrade handler reports failure by
/// letting the request continue as plain HTTP.
#[derive(Debug)]
pub enum HandshakeError {
    /// Request line or header block could not be parsed.
    InvalidRequest(String),
    /// Method is not GET.
    NotGet(String),
    /// A required header is absent.
    MissingHeader(&'static str),
    /// `Upgrade` / `Connection` headers do not announce a websocket upgrade.
    NotAnUpgrade,
    /// `Sec-WebSocket-Version` below 13 (or unparsable).
    UnsupportedVersion(String),
    /// `Sec-WebSocket-Key` is not the base64 encoding of exactly 16 bytes.
    InvalidKey,
    /// `Sec-WebSocket-Protocol` is empty: a peer must request a subprotocol.
    NoProtocolOffered,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid HTTP request: {msg}"),
            Self::NotGet(method) => write!(f, "upgrade requires GET, got '{method}'"),
            Self::MissingHeader(name) => write!(f, "missing required header: {name}"),
            Self::NotAnUpgrade => write!(f, "not a websocket upgrade request"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported WebSocket version: {v}"),
            Self::InvalidKey => write!(f, "invalid Sec-WebSocket-Key"),
            Self::NoProtocolOffered => write!(f, "no subprotocol offered"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Minimal HTTP request head, as parsed off the socket.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Headers, keyed lowercase.
    headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Parse an HTTP request head from bytes.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::InvalidRequest("invalid UTF-8".into()))?;

        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("missing method".into()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("missing path".into()))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    /// Build a request head from parts. Intended for hosts that already run
    /// their own HTTP parser.
    #[must_use]
    pub fn from_parts(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }

    /// Get a header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A validated upgrade request: the client key plus the subprotocol tokens
/// offered, in offer order.
#[derive(Debug, Clone)]
pub struct UpgradeOffer {
    /// The client's `Sec-WebSocket-Key`, verbatim.
    pub key: String,
    /// Offered subprotocol tokens, trimmed, in offer order.
    pub offered_protocols: Vec<String>,
}

/// Validate an upgrade request per this engine's rules.
///
/// Requires GET, `Connection: Upgrade`, `Upgrade: websocket`,
/// `Sec-WebSocket-Version >= 13`, a key decoding to exactly 16 bytes, and a
/// non-empty subprotocol offer.
pub fn validate_upgrade(request: &HttpRequest) -> Result<UpgradeOffer, HandshakeError> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::NotGet(request.method.clone()));
    }

    let connection = request
        .header("connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(HandshakeError::NotAnUpgrade);
    }

    let upgrade = request
        .header("upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::NotAnUpgrade);
    }

    let version = request
        .header("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    match version.trim().parse::<u32>() {
        Ok(v) if v >= 13 => {}
        _ => return Err(HandshakeError::UnsupportedVersion(version.to_string())),
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match base64::engine::general_purpose::STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    let offered = request
        .header("sec-websocket-protocol")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Protocol"))?;
    let offered_protocols: Vec<String> = offered
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if offered_protocols.is_empty() {
        return Err(HandshakeError::NoProtocolOffered);
    }

    Ok(UpgradeOffer {
        key: key.to_string(),
        offered_protocols,
    })
}

/// The 101 response for an accepted upgrade.
#[derive(Debug, Clone)]
pub struct AcceptResponse {
    /// Computed `Sec-WebSocket-Accept` value.
    pub accept_key: String,
    /// The chosen subprotocol token.
    pub protocol: String,
}

impl AcceptResponse {
    /// Build the response for a validated offer and chosen subprotocol.
    #[must_use]
    pub fn new(offer: &UpgradeOffer, protocol: impl Into<String>) -> Self {
        Self {
            accept_key: compute_accept_key(&offer.key),
            protocol: protocol.into(),
        }
    }

    /// Serialize the HTTP 101 response.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             Sec-WebSocket-Protocol: {}\r\n\
             \r\n",
            self.accept_key, self.protocol
        )
        .into_bytes()
    }
}

/// Serialize a plain HTTP error response, for requests that fall through.
#[must_use]
pub fn reject_bytes(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}
