//! Binary envelope encoding, with optional compression and encryption.
//!
//! Wire layout, after the mandatory outer head:
//!
//! ```text
//! <head>\x01[<field_1>\x01 ... <field_n>\x01]<content_type>\x01<content>
//! ```
//!
//! The bracketed inner tuple (which repeats the head as its first token) is
//! optionally DEFLATE-compressed, then optionally AES-256-CFB encrypted with
//! PKCS#7 padding. The outer head lets the demultiplexer reject a frame
//! cheaply; the inner head authenticates the decompressed/decrypted blob.
//!
//! Keys are passphrase-derived: the key string and IV string are each
//! digested with SHA-256; the key is the full 32-byte digest, the IV the
//! first 16 bytes of its digest. An empty key or IV string disables
//! encryption while leaving compression on.

use super::{Envelope, EnvelopeError, FrameEnvelope};
use crate::frame::{Frame, Opcode};
use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use sha2::{Digest, Sha256};

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Field/content separator inside the envelope.
const SEP: u8 = 0x01;

/// AES block size; PKCS#7 pads to a multiple of this.
const BLOCK_LEN: usize = 16;

/// Minimum bytes after the outer head separator.
const MIN_BLOB_LEN: usize = 5;

/// Minimum size of a decompressed inner tuple.
const MIN_INNER_LEN: usize = 4;

/// Passphrase-derived AES-256-CFB key material.
///
/// Cheap to copy; a fresh cipher is built per message from the stored key
/// and IV, so cloned codecs advance their streams independently.
#[derive(Clone)]
struct EnvelopeCipher {
    key: [u8; 32],
    iv: [u8; 16],
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("EnvelopeCipher").finish_non_exhaustive()
    }
}

impl EnvelopeCipher {
    /// Derive key material from passphrase strings. Returns `None` when
    /// either string is empty or the derived key is below 128 bits.
    fn derive(key_pass: &str, iv_pass: &str) -> Option<Self> {
        if key_pass.is_empty() || iv_pass.is_empty() {
            return None;
        }
        let key: [u8; 32] = Sha256::digest(key_pass.as_bytes()).into();
        let iv_digest: [u8; 32] = Sha256::digest(iv_pass.as_bytes()).into();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&iv_digest[..16]);

        if key.len() * 8 < 128 {
            return None;
        }
        Some(Self { key, iv })
    }

    fn encrypt(&self, mut data: Vec<u8>) -> Vec<u8> {
        let pad = BLOCK_LEN - (data.len() % BLOCK_LEN);
        data.resize(data.len() + pad, pad as u8);
        Aes256CfbEnc::new(&self.key.into(), &self.iv.into()).encrypt(&mut data);
        data
    }

    fn decrypt(&self, mut data: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
        if data.is_empty() || data.len() % BLOCK_LEN != 0 {
            return Err(EnvelopeError::CipherLength { len: data.len() });
        }
        Aes256CfbDec::new(&self.key.into(), &self.iv.into()).decrypt(&mut data);

        let Some(&pad_byte) = data.last() else {
            return Err(EnvelopeError::Padding);
        };
        let pad = pad_byte as usize;
        if pad == 0 || pad > BLOCK_LEN || pad > data.len() {
            return Err(EnvelopeError::Padding);
        }
        if !data[data.len() - pad..].iter().all(|&b| b == pad_byte) {
            return Err(EnvelopeError::Padding);
        }
        data.truncate(data.len() - pad);
        Ok(data)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::fast(),
    );
    encoder
        .write_all(data)
        .map_err(EnvelopeError::Compression)?;
    encoder.finish().map_err(EnvelopeError::Compression)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(EnvelopeError::Compression)?;
    Ok(out)
}

/// Binary envelope codec (`synopsebinary`).
#[derive(Debug, Clone)]
pub struct BinaryEnvelopeCodec {
    compressed: bool,
    cipher: Option<EnvelopeCipher>,
}

impl BinaryEnvelopeCodec {
    /// Plain codec: no encryption, compression per the flag.
    #[must_use]
    pub const fn new(compressed: bool) -> Self {
        Self {
            compressed,
            cipher: None,
        }
    }

    /// Keyed codec. An empty key or IV string disables encryption while
    /// leaving compression on.
    #[must_use]
    pub fn with_encryption(key: &str, iv: &str, compressed: bool) -> Self {
        Self {
            compressed,
            cipher: EnvelopeCipher::derive(key, iv),
        }
    }

    /// Whether payloads are encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Whether payloads are compressed.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed
    }
}

impl FrameEnvelope for BinaryEnvelopeCodec {
    fn encode(
        &self,
        head: &str,
        fields: &[&str],
        content_type: &str,
        content: &[u8],
    ) -> Result<Frame, EnvelopeError> {
        let mut inner = Vec::with_capacity(
            head.len() + content_type.len() + content.len() + fields.len() * 16 + 8,
        );
        inner.extend_from_slice(head.as_bytes());
        inner.push(SEP);
        for field in fields {
            inner.extend_from_slice(field.as_bytes());
            inner.push(SEP);
        }
        inner.extend_from_slice(content_type.as_bytes());
        inner.push(SEP);
        inner.extend_from_slice(content);

        let mut blob = inner;
        if self.compressed {
            blob = compress(&blob)?;
        }
        if let Some(cipher) = &self.cipher {
            blob = cipher.encrypt(blob);
        }

        let mut payload = Vec::with_capacity(head.len() + 1 + blob.len());
        payload.extend_from_slice(head.as_bytes());
        payload.push(SEP);
        payload.extend_from_slice(&blob);
        Ok(Frame::binary(payload))
    }

    fn decode(
        &self,
        frame: &Frame,
        expected_head: &str,
        field_count: usize,
    ) -> Result<Envelope, EnvelopeError> {
        if frame.opcode != Opcode::Binary {
            return Err(EnvelopeError::WrongOpcode {
                expected: Opcode::Binary,
                got: frame.opcode,
            });
        }

        let payload = frame.payload.as_ref();
        let sep = payload
            .iter()
            .position(|&b| b == SEP)
            .ok_or(EnvelopeError::MissingSeparator)?;
        let (outer_head, rest) = (&payload[..sep], &payload[sep + 1..]);
        if rest.len() < MIN_BLOB_LEN {
            return Err(EnvelopeError::TooShort { len: rest.len() });
        }
        check_head(outer_head, expected_head)?;

        let mut blob = rest.to_vec();
        if let Some(cipher) = &self.cipher {
            blob = cipher.decrypt(blob)?;
        }
        if self.compressed {
            blob = decompress(&blob)?;
            if blob.len() < MIN_INNER_LEN {
                return Err(EnvelopeError::TooShort { len: blob.len() });
            }
        }

        // head + n fields + content_type + content
        let tokens: Vec<&[u8]> = blob.splitn(field_count + 3, |&b| b == SEP).collect();
        if tokens.len() != field_count + 3 {
            return Err(EnvelopeError::FieldCount {
                expected: field_count,
                got: tokens.len().saturating_sub(3),
            });
        }

        // The inner head is the encoded redundancy: it authenticates the
        // decrypted/decompressed blob against the cheap outer tag.
        check_head(tokens[0], expected_head)?;

        let mut fields = Vec::with_capacity(field_count);
        for token in &tokens[1..=field_count] {
            fields.push(
                String::from_utf8(token.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)?,
            );
        }
        let content_type = String::from_utf8(tokens[field_count + 1].to_vec())
            .map_err(|_| EnvelopeError::InvalidUtf8)?;
        let content = tokens[field_count + 2].to_vec();

        Ok(Envelope {
            fields,
            content_type,
            content,
        })
    }
}

fn check_head(found: &[u8], expected: &str) -> Result<(), EnvelopeError> {
    let found = std::str::from_utf8(found).map_err(|_| EnvelopeError::InvalidUtf8)?;
    if found.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(EnvelopeError::HeadMismatch {
            expected: expected.to_string(),
            got: found.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{HEAD_ANSWER, HEAD_REQUEST};

    fn codecs() -> Vec<BinaryEnvelopeCodec> {
        vec![
            BinaryEnvelopeCodec::new(false),
            BinaryEnvelopeCodec::new(true),
            BinaryEnvelopeCodec::with_encryption("k", "i", false),
            BinaryEnvelopeCodec::with_encryption("k", "i", true),
        ]
    }

    #[test]
    fn test_roundtrip_matrix() {
        // compression {off,on} x encryption {off,keyed}
        for codec in codecs() {
            let content: Vec<u8> = (0u8..=255).collect();
            let frame = codec
                .encode(
                    HEAD_REQUEST,
                    &["GET", "/path", "Accept: */*"],
                    "application/octet-stream",
                    &content,
                )
                .unwrap();
            assert_eq!(frame.opcode, Opcode::Binary);

            let envelope = codec.decode(&frame, HEAD_REQUEST, 3).unwrap();
            assert_eq!(envelope.fields, ["GET", "/path", "Accept: */*"]);
            assert_eq!(envelope.content_type, "application/octet-stream");
            assert_eq!(envelope.content, content);
        }
    }

    #[test]
    fn test_answer_roundtrip_compressed_keyed() {
        let codec = BinaryEnvelopeCodec::with_encryption("k", "i", true);
        let frame = codec
            .encode(
                HEAD_ANSWER,
                &["200", ""],
                "application/json",
                br#"{"ok":true}"#,
            )
            .unwrap();

        // Ciphertext is opaque: the content must not appear in the payload.
        let haystack = frame.payload.as_ref();
        assert!(!haystack
            .windows(4)
            .any(|window| window == br#""ok""#.as_slice()));
        // The outer head stays in the clear for cheap demultiplexing.
        assert!(haystack.starts_with(b"answer\x01"));

        let envelope = codec.decode(&frame, HEAD_ANSWER, 2).unwrap();
        assert_eq!(envelope.fields, ["200", ""]);
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.content, br#"{"ok":true}"#);
    }

    #[test]
    fn test_empty_key_disables_encryption() {
        assert!(!BinaryEnvelopeCodec::with_encryption("", "i", true).is_encrypted());
        assert!(!BinaryEnvelopeCodec::with_encryption("k", "", true).is_encrypted());
        let codec = BinaryEnvelopeCodec::with_encryption("", "", true);
        assert!(!codec.is_encrypted());
        assert!(codec.is_compressed());
    }

    #[test]
    fn test_content_may_contain_separators() {
        let codec = BinaryEnvelopeCodec::new(true);
        let content = b"a\x01b\x01\x01c";
        let frame = codec
            .encode(HEAD_REQUEST, &["GET", "/s", ""], "application/pdf", content)
            .unwrap();
        let envelope = codec.decode(&frame, HEAD_REQUEST, 3).unwrap();
        assert_eq!(envelope.content, content);
    }

    #[test]
    fn test_decode_rejects_text_frame() {
        let codec = BinaryEnvelopeCodec::new(false);
        let frame = Frame::text("request\x01whatever");
        let err = codec.decode(&frame, HEAD_REQUEST, 3).unwrap_err();
        assert!(matches!(err, EnvelopeError::WrongOpcode { .. }));
    }

    #[test]
    fn test_decode_rejects_short_blob() {
        let codec = BinaryEnvelopeCodec::new(false);
        let frame = Frame::binary(b"request\x01abc".to_vec());
        let err = codec.decode(&frame, HEAD_REQUEST, 3).unwrap_err();
        assert!(matches!(err, EnvelopeError::TooShort { len: 3 }));
    }

    #[test]
    fn test_decode_rejects_outer_head_mismatch() {
        let codec = BinaryEnvelopeCodec::new(false);
        let frame = codec
            .encode(HEAD_ANSWER, &["200", ""], "", b"")
            .unwrap();
        let err = codec.decode(&frame, HEAD_REQUEST, 2).unwrap_err();
        assert!(matches!(err, EnvelopeError::HeadMismatch { .. }));
    }

    #[test]
    fn test_decode_verifies_inner_head_redundancy() {
        // Craft a payload whose outer head says "request" but whose inner
        // tuple was encoded under "answer".
        let codec = BinaryEnvelopeCodec::new(false);
        let inner_frame = codec
            .encode(HEAD_ANSWER, &["200", ""], "", b"payload")
            .unwrap();
        let inner_blob = &inner_frame.payload.as_ref()[b"answer\x01".len()..];

        let mut forged = b"request\x01".to_vec();
        forged.extend_from_slice(inner_blob);
        let err = codec
            .decode(&Frame::binary(forged), HEAD_REQUEST, 2)
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::HeadMismatch { .. }));
    }

    #[test]
    fn test_decode_head_case_insensitive() {
        let codec = BinaryEnvelopeCodec::new(true);
        let frame = codec
            .encode("Request", &["GET", "/x", ""], "", b"data")
            .unwrap();
        let envelope = codec.decode(&frame, HEAD_REQUEST, 3).unwrap();
        assert_eq!(envelope.fields[0], "GET");
    }

    #[test]
    fn test_decrypt_rejects_unaligned_ciphertext() {
        let codec = BinaryEnvelopeCodec::with_encryption("k", "i", false);
        let frame = Frame::binary(b"request\x01abcdefgh".to_vec());
        let err = codec.decode(&frame, HEAD_REQUEST, 3).unwrap_err();
        assert!(matches!(err, EnvelopeError::CipherLength { .. }));
    }

    #[test]
    fn test_keyed_decode_requires_matching_key() {
        let sender = BinaryEnvelopeCodec::with_encryption("k", "i", true);
        let frame = sender
            .encode(HEAD_REQUEST, &["GET", "/x", ""], "", b"secret")
            .unwrap();

        let wrong_key = BinaryEnvelopeCodec::with_encryption("other", "i", true);
        assert!(wrong_key.decode(&frame, HEAD_REQUEST, 3).is_err());
    }

    #[test]
    fn test_clones_are_independent() {
        let original = BinaryEnvelopeCodec::with_encryption("k", "i", true);
        let cloned = original.clone();
        assert!(cloned.is_encrypted());
        assert!(cloned.is_compressed());

        // Each clone drives its own stream: both decode what the other encodes.
        let frame = original
            .encode(HEAD_REQUEST, &["GET", "/x", ""], "", b"shared")
            .unwrap();
        let envelope = cloned.decode(&frame, HEAD_REQUEST, 3).unwrap();
        assert_eq!(envelope.content, b"shared");
    }

    #[test]
    fn test_compression_shrinks_repetitive_content() {
        let plain = BinaryEnvelopeCodec::new(false);
        let squeezed = BinaryEnvelopeCodec::new(true);
        let content = vec![b'x'; 16 * 1024];

        let fat = plain
            .encode(HEAD_REQUEST, &["GET", "/x", ""], "application/pdf", &content)
            .unwrap();
        let slim = squeezed
            .encode(HEAD_REQUEST, &["GET", "/x", ""], "application/pdf", &content)
            .unwrap();
        assert!(slim.payload.len() < fat.payload.len() / 4);
    }
}
