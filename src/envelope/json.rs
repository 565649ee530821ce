//! Text/JSON envelope encoding.
//!
//! One Text frame per message, payload shaped as
//!
//! ```json
//! {"request":["GET","/x","","application/json",{"a":1}]}
//! ```
//!
//! The trailing content slot follows four rules, keyed on the content type:
//!
//! - empty content encodes as `""`
//! - JSON content (or an empty content type) is inlined verbatim
//! - `text/*` content is carried as one JSON string
//! - anything else becomes a base64 string prefixed with U+FFF0
//!
//! Decoding inverts the same rules using the content type read from the
//! slot before the content.

use super::{
    is_json_content_type, is_text_content_type, Envelope, EnvelopeError, FrameEnvelope,
};
use crate::frame::{Frame, Opcode};
use base64::Engine;
use serde_json::value::RawValue;
use std::collections::HashMap;

/// Marker prefixed to base64-encoded binary content inside a JSON string.
const BASE64_MAGIC: char = '\u{FFF0}';

/// Shortest well-formed payload: `{"a":["",""]}` and friends.
const MIN_PAYLOAD_LEN: usize = 10;

/// Stateless JSON envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeCodec;

impl JsonEnvelopeCodec {
    /// Create the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FrameEnvelope for JsonEnvelopeCodec {
    fn encode(
        &self,
        head: &str,
        fields: &[&str],
        content_type: &str,
        content: &[u8],
    ) -> Result<Frame, EnvelopeError> {
        let mut out = String::with_capacity(64 + content.len());
        out.push('{');
        out.push_str(&serde_json::to_string(head)?);
        out.push_str(":[");
        for field in fields {
            out.push_str(&serde_json::to_string(field)?);
            out.push(',');
        }
        out.push_str(&serde_json::to_string(content_type)?);
        out.push(',');

        if content.is_empty() {
            out.push_str("\"\"");
        } else if content_type.is_empty() || is_json_content_type(content_type) {
            // Inlined verbatim, no escaping.
            let raw = std::str::from_utf8(content).map_err(|_| EnvelopeError::InvalidUtf8)?;
            out.push_str(raw);
        } else if is_text_content_type(content_type) {
            let text = std::str::from_utf8(content).map_err(|_| EnvelopeError::InvalidUtf8)?;
            out.push_str(&serde_json::to_string(text)?);
        } else {
            let mut encoded = String::with_capacity(content.len() / 3 * 4 + 8);
            encoded.push(BASE64_MAGIC);
            base64::engine::general_purpose::STANDARD.encode_string(content, &mut encoded);
            out.push_str(&serde_json::to_string(&encoded)?);
        }

        out.push_str("]}");
        Ok(Frame::text(out))
    }

    fn decode(
        &self,
        frame: &Frame,
        expected_head: &str,
        field_count: usize,
    ) -> Result<Envelope, EnvelopeError> {
        if frame.opcode != Opcode::Text {
            return Err(EnvelopeError::WrongOpcode {
                expected: Opcode::Text,
                got: frame.opcode,
            });
        }
        if frame.payload.len() < MIN_PAYLOAD_LEN {
            return Err(EnvelopeError::TooShort {
                len: frame.payload.len(),
            });
        }

        let text =
            std::str::from_utf8(&frame.payload).map_err(|_| EnvelopeError::InvalidUtf8)?;
        let object: HashMap<String, Vec<&RawValue>> = serde_json::from_str(text)?;

        let (head, slots) = object
            .iter()
            .next()
            .ok_or(EnvelopeError::MissingSeparator)?;
        if object.len() != 1 || !head.eq_ignore_ascii_case(expected_head) {
            return Err(EnvelopeError::HeadMismatch {
                expected: expected_head.to_string(),
                got: head.clone(),
            });
        }

        if slots.len() != field_count + 2 {
            return Err(EnvelopeError::FieldCount {
                expected: field_count,
                got: slots.len().saturating_sub(2),
            });
        }

        let mut fields = Vec::with_capacity(field_count);
        for slot in &slots[..field_count] {
            fields.push(serde_json::from_str::<String>(slot.get())?);
        }
        let content_type: String = serde_json::from_str(slots[field_count].get())?;
        let content = decode_content(slots[field_count + 1].get(), &content_type)?;

        Ok(Envelope {
            fields,
            content_type,
            content,
        })
    }
}

/// Recover the content bytes from the raw JSON of the content slot.
fn decode_content(raw: &str, content_type: &str) -> Result<Vec<u8>, EnvelopeError> {
    if content_type.is_empty() || is_json_content_type(content_type) {
        // Raw inline JSON; `""` is the encoding of empty content.
        if raw == "\"\"" {
            return Ok(Vec::new());
        }
        return Ok(raw.as_bytes().to_vec());
    }
    if is_text_content_type(content_type) {
        let text: String = serde_json::from_str(raw)?;
        return Ok(text.into_bytes());
    }

    let text: String = serde_json::from_str(raw)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let encoded = text
        .strip_prefix(BASE64_MAGIC)
        .ok_or(EnvelopeError::MagicMissing)?;
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}
