//! Envelope codecs: a REST-shaped tuple in and out of one frame payload.
//!
//! An envelope carries `(head, fields..., content_type, content)` where
//! `head` is `"request"` for client->server (and server-initiated callback)
//! traffic and `"answer"` for the reply direction. Two encodings exist:
//!
//! - [`json::JsonEnvelopeCodec`]: a Text frame holding
//!   `{"<head>":["field1",...,"<content_type>",<content>]}`
//! - [`binary::BinaryEnvelopeCodec`]: a Binary frame holding
//!   `<head>\x01<blob>` where the blob is the `\x01`-separated tuple,
//!   optionally compressed and encrypted
//!
//! Head comparison is case-insensitive on decode in both encodings.

pub mod binary;
pub mod json;

use crate::frame::{Frame, Opcode};
use std::fmt;
use std::io;

/// Head tag for the request direction.
pub const HEAD_REQUEST: &str = "request";
/// Head tag for the answer direction.
pub const HEAD_ANSWER: &str = "answer";

/// Canonical JSON content type.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A decoded envelope: positional fields, content type, raw content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Positional string fields (method/url/headers or status/headers).
    pub fields: Vec<String>,
    /// Content type of `content`; may be empty.
    pub content_type: String,
    /// Raw content bytes.
    pub content: Vec<u8>,
}

/// Envelope codec errors. All of them are per-request fatal: the frame that
/// produced one is dropped and the connection enters its error state.
#[derive(Debug)]
pub enum EnvelopeError {
    /// Frame opcode does not match the encoding (Text vs Binary).
    WrongOpcode {
        /// Opcode required by the encoding.
        expected: Opcode,
        /// Opcode actually seen.
        got: Opcode,
    },
    /// Payload shorter than the encoding's minimum.
    TooShort {
        /// Observed length in bytes.
        len: usize,
    },
    /// Head tag does not match the expected direction.
    HeadMismatch {
        /// Head the caller expected.
        expected: String,
        /// Head found in the payload.
        got: String,
    },
    /// Wrong number of positional fields.
    FieldCount {
        /// Field count the caller expected.
        expected: usize,
        /// Field count found.
        got: usize,
    },
    /// Payload separator structure is broken.
    MissingSeparator,
    /// JSON payload is malformed.
    Json(serde_json::Error),
    /// Base64 content did not decode.
    Base64(base64::DecodeError),
    /// Binary content string lacks the base64 magic marker.
    MagicMissing,
    /// A field or text content is not valid UTF-8.
    InvalidUtf8,
    /// Ciphertext length is not a whole number of blocks.
    CipherLength {
        /// Observed ciphertext length.
        len: usize,
    },
    /// PKCS#7 padding failed verification.
    Padding,
    /// Compressed blob did not inflate.
    Compression(io::Error),
    /// Answer status field is not a number.
    InvalidStatus(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongOpcode { expected, got } => {
                write!(f, "wrong frame opcode: expected {expected:?}, got {got:?}")
            }
            Self::TooShort { len } => write!(f, "envelope payload too short: {len} bytes"),
            Self::HeadMismatch { expected, got } => {
                write!(f, "envelope head mismatch: expected '{expected}', got '{got}'")
            }
            Self::FieldCount { expected, got } => {
                write!(f, "envelope field count mismatch: expected {expected}, got {got}")
            }
            Self::MissingSeparator => write!(f, "envelope separator missing"),
            Self::Json(e) => write!(f, "malformed JSON envelope: {e}"),
            Self::Base64(e) => write!(f, "content base64 decode failed: {e}"),
            Self::MagicMissing => write!(f, "binary content lacks base64 magic marker"),
            Self::InvalidUtf8 => write!(f, "field is not valid UTF-8"),
            Self::CipherLength { len } => {
                write!(f, "ciphertext length {len} is not block-aligned")
            }
            Self::Padding => write!(f, "PKCS#7 padding verification failed"),
            Self::Compression(e) => write!(f, "decompression failed: {e}"),
            Self::InvalidStatus(s) => write!(f, "answer status is not a number: '{s}'"),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Base64(e) => Some(e),
            Self::Compression(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<base64::DecodeError> for EnvelopeError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Base64(err)
    }
}

/// Capability shared by the REST subprotocol encodings.
///
/// `fields` are positional: `[method, url, headers]` under the request head,
/// `[status, headers]` under the answer head. `field_count` on decode is the
/// number of such slots the caller expects.
pub trait FrameEnvelope: Send {
    /// Serialize one REST-shaped tuple into a frame.
    fn encode(
        &self,
        head: &str,
        fields: &[&str],
        content_type: &str,
        content: &[u8],
    ) -> Result<Frame, EnvelopeError>;

    /// Deserialize a frame into an envelope, verifying the head tag.
    fn decode(
        &self,
        frame: &Frame,
        expected_head: &str,
        field_count: usize,
    ) -> Result<Envelope, EnvelopeError>;
}

/// True for the canonical JSON content type, with or without parameters.
pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    // Byte-wise comparison: content types are attacker-supplied and need
    // not be ASCII, so str slicing could split a code point.
    let ct = content_type.trim().as_bytes();
    let base = JSON_CONTENT_TYPE.as_bytes();
    if ct.len() < base.len() {
        return false;
    }
    ct[..base.len()].eq_ignore_ascii_case(base)
        && (ct.len() == base.len() || ct[base.len()] == b';')
}

/// True for `text/*` content types.
pub(crate) fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.trim().as_bytes();
    ct.len() >= 5 && ct[..5].eq_ignore_ascii_case(b"text/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_content_type_matching() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("Application/JSON"));
        assert!(is_json_content_type("application/json; charset=UTF-8"));
        assert!(!is_json_content_type("application/jsonseq"));
        assert!(!is_json_content_type("text/json-ish"));
        assert!(!is_json_content_type(""));
    }

    #[test]
    fn test_text_content_type_matching() {
        assert!(is_text_content_type("text/plain"));
        assert!(is_text_content_type("TEXT/html"));
        assert!(!is_text_content_type("application/octet-stream"));
        assert!(!is_text_content_type("tex"));
    }
}
