//! Subprotocol variants and the prototype registry.
//!
//! A protocol is negotiated by name in `Sec-WebSocket-Protocol` and cloned
//! from its registered prototype at upgrade time, so every connection owns
//! an independent instance. Three variants exist:
//!
//! - [`ChatProtocol`]: opaque text/binary frames, a user callback per
//!   inbound frame, never an answer frame
//! - [`JsonRestProtocol`] (`synopsejson`): Text-frame REST envelope
//! - [`BinaryRestProtocol`] (`synopsebinary`): Binary-frame REST envelope
//!   with optional compression and encryption

use crate::connection::ConnectionId;
use crate::envelope::binary::BinaryEnvelopeCodec;
use crate::envelope::json::JsonEnvelopeCodec;
use crate::envelope::{EnvelopeError, FrameEnvelope};
use crate::frame::Frame;
use crate::rest::{self, RestHandler};
use std::sync::Arc;

/// Subprotocol token for the JSON REST encoding.
pub const PROTOCOL_JSON: &str = "synopsejson";
/// Subprotocol token for the binary REST encoding.
pub const PROTOCOL_BINARY: &str = "synopsebinary";

/// What a protocol instance sees while processing one inbound frame.
pub struct ProtocolContext<'a> {
    /// Host REST handler, invoked synchronously.
    pub handler: &'a dyn RestHandler,
    /// Identity of the connection the frame arrived on.
    pub connection_id: ConnectionId,
}

/// Capability trait over the protocol variants.
///
/// Instances are per-connection and mutable; prototypes live in the
/// [`ProtocolRegistry`] and are cloned out via [`WsProtocol::clone_boxed`].
pub trait WsProtocol: Send {
    /// The token negotiated in `Sec-WebSocket-Protocol`.
    fn name(&self) -> &str;

    /// Handle one inbound data frame. `Ok(Some(frame))` is the answer to
    /// send on the wire; `Ok(None)` means no answer.
    fn process_frame(
        &mut self,
        ctx: &ProtocolContext<'_>,
        frame: &Frame,
    ) -> Result<Option<Frame>, EnvelopeError>;

    /// Produce a fresh, independent instance for a new connection.
    fn clone_boxed(&self) -> Box<dyn WsProtocol>;

    /// The REST envelope capability, when this subprotocol carries one.
    /// Protocols without it cannot serve outbound callbacks.
    fn envelope(&self) -> Option<&dyn FrameEnvelope> {
        None
    }
}

/// Callback fired by [`ChatProtocol`] for every inbound data frame.
pub type ChatFrameCallback = Arc<dyn Fn(ConnectionId, &Frame) + Send + Sync>;

/// Opaque frame relay: fires a user callback per inbound frame and never
/// answers from `process_frame`.
#[derive(Clone)]
pub struct ChatProtocol {
    name: String,
    on_frame: Option<ChatFrameCallback>,
}

impl ChatProtocol {
    /// Create a chat protocol with the given negotiation token.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_frame: None,
        }
    }

    /// Install the per-frame callback.
    #[must_use]
    pub fn on_frame(mut self, callback: ChatFrameCallback) -> Self {
        self.on_frame = Some(callback);
        self
    }
}

impl WsProtocol for ChatProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_frame(
        &mut self,
        ctx: &ProtocolContext<'_>,
        frame: &Frame,
    ) -> Result<Option<Frame>, EnvelopeError> {
        if let Some(callback) = &self.on_frame {
            callback(ctx.connection_id, frame);
        }
        Ok(None)
    }

    fn clone_boxed(&self) -> Box<dyn WsProtocol> {
        Box::new(self.clone())
    }
}

/// Shared request/answer exchange for the two REST encodings.
fn process_rest_frame(
    codec: &dyn FrameEnvelope,
    ctx: &ProtocolContext<'_>,
    frame: &Frame,
) -> Result<Option<Frame>, EnvelopeError> {
    let request = rest::frame_to_request(codec, frame)?;
    tracing::trace!(
        connection = %ctx.connection_id,
        method = %request.method,
        url = %request.url,
        "inbound REST request"
    );
    let response = ctx.handler.handle(&request);
    let answer = rest::answer_to_frame(codec, &response)?;
    Ok(Some(answer))
}

/// REST over the text/JSON envelope (`synopsejson`).
#[derive(Debug, Clone, Default)]
pub struct JsonRestProtocol {
    codec: JsonEnvelopeCodec,
}

impl JsonRestProtocol {
    /// Create the JSON REST protocol.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            codec: JsonEnvelopeCodec::new(),
        }
    }
}

impl WsProtocol for JsonRestProtocol {
    fn name(&self) -> &str {
        PROTOCOL_JSON
    }

    fn process_frame(
        &mut self,
        ctx: &ProtocolContext<'_>,
        frame: &Frame,
    ) -> Result<Option<Frame>, EnvelopeError> {
        process_rest_frame(&self.codec, ctx, frame)
    }

    fn clone_boxed(&self) -> Box<dyn WsProtocol> {
        Box::new(self.clone())
    }

    fn envelope(&self) -> Option<&dyn FrameEnvelope> {
        Some(&self.codec)
    }
}

/// REST over the binary envelope (`synopsebinary`).
#[derive(Debug, Clone)]
pub struct BinaryRestProtocol {
    codec: BinaryEnvelopeCodec,
}

impl BinaryRestProtocol {
    /// Plain variant: compression per the flag, no encryption.
    #[must_use]
    pub const fn new(compressed: bool) -> Self {
        Self {
            codec: BinaryEnvelopeCodec::new(compressed),
        }
    }

    /// Keyed variant. An empty key or IV disables encryption while leaving
    /// compression on.
    #[must_use]
    pub fn with_encryption(key: &str, iv: &str, compressed: bool) -> Self {
        Self {
            codec: BinaryEnvelopeCodec::with_encryption(key, iv, compressed),
        }
    }

    /// Whether this instance encrypts payloads.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }
}

impl WsProtocol for BinaryRestProtocol {
    fn name(&self) -> &str {
        PROTOCOL_BINARY
    }

    fn process_frame(
        &mut self,
        ctx: &ProtocolContext<'_>,
        frame: &Frame,
    ) -> Result<Option<Frame>, EnvelopeError> {
        process_rest_frame(&self.codec, ctx, frame)
    }

    fn clone_boxed(&self) -> Box<dyn WsProtocol> {
        Box::new(self.clone())
    }

    fn envelope(&self) -> Option<&dyn FrameEnvelope> {
        Some(&self.codec)
    }
}

/// Insertion-ordered prototype store. Lookup is case-insensitive; names are
/// unique.
#[derive(Default)]
pub struct ProtocolRegistry {
    prototypes: Vec<Box<dyn WsProtocol>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prototype. Returns false (and drops the prototype) when
    /// the name is already taken.
    pub fn add(&mut self, protocol: Box<dyn WsProtocol>) -> bool {
        if self.find(protocol.name()).is_some() {
            return false;
        }
        self.prototypes.push(protocol);
        true
    }

    /// Remove a prototype by name. Returns false when absent.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.find(name) {
            Some(index) => {
                self.prototypes.remove(index);
                true
            }
            None => false,
        }
    }

    /// Clone a registered prototype by name.
    #[must_use]
    pub fn clone_by_name(&self, name: &str) -> Option<Box<dyn WsProtocol>> {
        self.find(name)
            .map(|index| self.prototypes[index].clone_boxed())
    }

    /// Pick the first offered token with a registered prototype and clone
    /// it. Offer order wins, not registration order.
    #[must_use]
    pub fn select<'a>(
        &self,
        offered: impl IntoIterator<Item = &'a str>,
    ) -> Option<Box<dyn WsProtocol>> {
        offered
            .into_iter()
            .find_map(|token| self.clone_by_name(token))
    }

    /// Number of registered prototypes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.prototypes
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))
    }
}
