//! REST-shaped message model and the envelope adapters.
//!
//! The engine does not route or interpret REST semantics; it moves
//! `(method, url, headers, content_type, content)` one way and
//! `(status, headers, content_type, content)` the other, and hands the
//! inbound side to a host-provided [`RestHandler`].

use crate::envelope::{EnvelopeError, FrameEnvelope, HEAD_ANSWER, HEAD_REQUEST};
use crate::frame::Frame;

/// An inbound (or outbound callback) REST request in transit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestRequest {
    /// HTTP-like method token.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Raw request headers, one `Name: value` per line.
    pub in_headers: String,
    /// Content type of `content`; may be empty.
    pub content_type: String,
    /// Request body.
    pub content: Vec<u8>,
}

impl RestRequest {
    /// Convenience constructor for the common no-body case.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Self::default()
        }
    }
}

/// The answer travelling back for a [`RestRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response headers, one `Name: value` per line.
    pub out_headers: String,
    /// Content type of `content`; may be empty.
    pub content_type: String,
    /// Response body.
    pub content: Vec<u8>,
}

impl RestResponse {
    /// A bare response with the given status and no body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Host-side request handler, invoked synchronously on the connection's
/// reader thread (or, for drained requests, on the callback thread).
pub trait RestHandler: Send + Sync {
    /// Serve one request.
    fn handle(&self, request: &RestRequest) -> RestResponse;
}

impl<F> RestHandler for F
where
    F: Fn(&RestRequest) -> RestResponse + Send + Sync,
{
    fn handle(&self, request: &RestRequest) -> RestResponse {
        self(request)
    }
}

/// Encode a request under the `"request"` head.
pub fn request_to_frame(
    codec: &dyn FrameEnvelope,
    request: &RestRequest,
) -> Result<Frame, EnvelopeError> {
    codec.encode(
        HEAD_REQUEST,
        &[&request.method, &request.url, &request.in_headers],
        &request.content_type,
        &request.content,
    )
}

/// Decode a frame carrying the `"request"` head.
pub fn frame_to_request(
    codec: &dyn FrameEnvelope,
    frame: &Frame,
) -> Result<RestRequest, EnvelopeError> {
    let mut envelope = codec.decode(frame, HEAD_REQUEST, 3)?;
    let in_headers = envelope.fields.pop().unwrap_or_default();
    let url = envelope.fields.pop().unwrap_or_default();
    let method = envelope.fields.pop().unwrap_or_default();
    Ok(RestRequest {
        method,
        url,
        in_headers,
        content_type: envelope.content_type,
        content: envelope.content,
    })
}

/// Encode a response under the `"answer"` head.
pub fn answer_to_frame(
    codec: &dyn FrameEnvelope,
    response: &RestResponse,
) -> Result<Frame, EnvelopeError> {
    codec.encode(
        HEAD_ANSWER,
        &[&response.status.to_string(), &response.out_headers],
        &response.content_type,
        &response.content,
    )
}

/// Decode a frame carrying the `"answer"` head.
pub fn frame_to_answer(
    codec: &dyn FrameEnvelope,
    frame: &Frame,
) -> Result<RestResponse, EnvelopeError> {
    let mut envelope = codec.decode(frame, HEAD_ANSWER, 2)?;
    let out_headers = envelope.fields.pop().unwrap_or_default();
    let status_text = envelope.fields.pop().unwrap_or_default();
    let status = status_text
        .trim()
        .parse::<u16>()
        .map_err(|_| EnvelopeError::InvalidStatus(status_text))?;
    Ok(RestResponse {
        status,
        out_headers,
        content_type: envelope.content_type,
        content: envelope.content,
    })
}
