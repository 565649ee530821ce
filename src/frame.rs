//! WebSocket frame codec according to RFC 6455.
//!
//! Implements the wire format used by the engine:
//! - Header parsing and serialization
//! - Continuation reassembly on read (fragmentation is never produced on write)
//! - Payload size caps enforced before any payload byte is read
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//! ```
//!
//! This engine serves the server role only and restricts the format
//! accordingly: inbound frames must be unmasked (a masked header is a fatal
//! protocol violation), outbound frames always carry FIN=1 and MASK=0, and
//! RSV bits are ignored on read. Reserved opcodes are propagated to the
//! caller untouched; higher layers ignore everything but Ping/Pong/Close.
//!
//! Each fragment of a fragmented message must repeat the first fragment's
//! opcode. A mid-stream opcode change aborts the connection.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::{Duration, Instant};

/// Hard cap on a single frame's declared payload length: 128 MiB.
///
/// A header announcing more is a fatal connection error, detected before
/// any payload byte is consumed.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 28;

/// How long a started (fragmented) message may wait for its next fragment
/// before the connection is considered broken.
const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket frame opcode (4 bits).
///
/// All sixteen values are representable so that reserved opcodes survive a
/// read intact. Only Close/Ping/Pong receive special treatment upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Reserved non-control opcode 0x3.
    Reserved3 = 0x3,
    /// Reserved non-control opcode 0x4.
    Reserved4 = 0x4,
    /// Reserved non-control opcode 0x5.
    Reserved5 = 0x5,
    /// Reserved non-control opcode 0x6.
    Reserved6 = 0x6,
    /// Reserved non-control opcode 0x7.
    Reserved7 = 0x7,
    /// Connection close control frame.
    ConnectionClose = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
    /// Reserved control opcode 0xB.
    ReservedB = 0xB,
    /// Reserved control opcode 0xC.
    ReservedC = 0xC,
    /// Reserved control opcode 0xD.
    ReservedD = 0xD,
    /// Reserved control opcode 0xE.
    ReservedE = 0xE,
    /// Reserved control opcode 0xF.
    ReservedF = 0xF,
}

impl Opcode {
    /// Map the low 4 bits of a header byte to an opcode. Total: reserved
    /// values map to their `Reserved*` variant instead of failing.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x3 => Self::Reserved3,
            0x4 => Self::Reserved4,
            0x5 => Self::Reserved5,
            0x6 => Self::Reserved6,
            0x7 => Self::Reserved7,
            0x8 => Self::ConnectionClose,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            0xB => Self::ReservedB,
            0xC => Self::ReservedC,
            0xD => Self::ReservedD,
            0xE => Self::ReservedE,
            _ => Self::ReservedF,
        }
    }

    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::ConnectionClose | Self::Ping | Self::Pong)
    }

    /// Returns true for opcodes RFC 6455 leaves reserved.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        !matches!(
            self,
            Self::Continuation
                | Self::Text
                | Self::Binary
                | Self::ConnectionClose
                | Self::Ping
                | Self::Pong
        )
    }
}

/// A fully reassembled WebSocket frame.
///
/// FIN is a wire-level concern owned by the codec; by the time a `Frame`
/// reaches the caller its fragments have been merged and the first
/// fragment's opcode pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// Payload data.
    pub payload: Bytes,
}

impl Frame {
    /// Create a text frame with the given payload.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// Create a binary frame with the given payload.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// Create a ping frame with optional payload.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    /// Create a pong frame with optional payload.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Create a close frame carrying the given payload verbatim.
    #[must_use]
    pub fn close(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::ConnectionClose,
            payload: payload.into(),
        }
    }
}

/// Frame codec errors. All variants are fatal for the connection.
#[derive(Debug)]
pub enum FrameError {
    /// Peer sent a masked frame; this server expects unmasked input.
    MaskedFrame,
    /// A continuation fragment changed opcode mid-message.
    FragmentOpcodeMismatch {
        /// Opcode of the first fragment.
        first: Opcode,
        /// Opcode of the offending fragment.
        got: Opcode,
    },
    /// Declared payload length exceeds [`MAX_PAYLOAD_LEN`].
    PayloadTooLarge {
        /// Declared length in bytes.
        size: u64,
    },
    /// A fragmented message stalled waiting for its next fragment.
    ContinuationTimeout,
    /// Transport failure.
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaskedFrame => write!(f, "unsupported MASK bit on inbound frame"),
            Self::FragmentOpcodeMismatch { first, got } => {
                write!(f, "fragment opcode changed mid-message: {first:?} -> {got:?}")
            }
            Self::PayloadTooLarge { size } => {
                write!(f, "payload too large: {size} bytes (max: {MAX_PAYLOAD_LEN})")
            }
            Self::ContinuationTimeout => write!(f, "timed out waiting for continuation fragment"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Byte-stream seam between the frame codec and the transport.
///
/// [`TcpWire`] implements this over `std::net::TcpStream`; tests substitute
/// in-memory pipes.
pub trait WireIo {
    /// Read whatever is available into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` on end of stream. A timeout surfaces as
    /// `io::ErrorKind::WouldBlock` or `io::ErrorKind::TimedOut`.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Queue bytes on the buffered send path.
    fn send(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Send bytes immediately, bypassing the coalescing buffer. Any bytes
    /// still queued are written first so ordering is preserved.
    fn send_unbuffered(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush the buffered send path.
    fn flush(&mut self) -> io::Result<()>;
}

impl<W: WireIo + ?Sized> WireIo for Box<W> {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).recv(buf, timeout)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).send(buf)
    }

    fn send_unbuffered(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).send_unbuffered(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Coalescing window for the buffered send path.
const SEND_COALESCE_LIMIT: usize = 64 * 1024;

/// [`WireIo`] over a blocking TCP stream with a 64 KB send coalescing
/// buffer.
#[derive(Debug)]
pub struct TcpWire {
    stream: std::net::TcpStream,
    out_buf: Vec<u8>,
}

impl TcpWire {
    /// Wrap a connected TCP stream.
    #[must_use]
    pub fn new(stream: std::net::TcpStream) -> Self {
        Self {
            stream,
            out_buf: Vec::with_capacity(4096),
        }
    }
}

impl WireIo for TcpWire {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::io::Read;
        // set_read_timeout(Some(0)) is an error; clamp to 1 ms.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.out_buf.extend_from_slice(buf);
        if self.out_buf.len() >= SEND_COALESCE_LIMIT {
            self.flush()?;
        }
        Ok(())
    }

    fn send_unbuffered(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.flush()?;
        self.stream.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        use std::io::Write;
        if !self.out_buf.is_empty() {
            self.stream.write_all(&self.out_buf)?;
            self.out_buf.clear();
        }
        self.stream.flush()
    }
}

/// One wire-level fragment, before reassembly.
#[derive(Debug)]
struct Fragment {
    fin: bool,
    opcode: Opcode,
    payload: Bytes,
}

/// Decode state for the sans-IO codec.
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the first 2 header bytes.
    Header,
    /// Reading extended payload length (2 or 8 bytes, big-endian).
    ExtendedLength {
        fin: bool,
        opcode: Opcode,
        bytes_needed: usize,
    },
    /// Reading payload data.
    Payload {
        fin: bool,
        opcode: Opcode,
        payload_len: u64,
    },
}

/// Sans-IO frame parser: feed bytes in via a `BytesMut`, get fragments out.
///
/// The state machine is restart-safe: `decode` returning `Ok(None)` means
/// "need more bytes" and leaves the buffer and state ready for the next
/// call.
#[derive(Debug)]
struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    const fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Fragment>, FrameError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let first_byte = src[0];
                    let second_byte = src[1];

                    let fin = (first_byte & 0x80) != 0;
                    // RSV1..3 ignored: no extensions are negotiated.
                    let opcode = Opcode::from_u8(first_byte & 0x0F);
                    let masked = (second_byte & 0x80) != 0;
                    let len7 = second_byte & 0x7F;

                    if masked {
                        return Err(FrameError::MaskedFrame);
                    }

                    let _ = src.split_to(2);

                    match len7 {
                        0..=125 => {
                            self.state = DecodeState::Payload {
                                fin,
                                opcode,
                                payload_len: u64::from(len7),
                            };
                        }
                        126 => {
                            self.state = DecodeState::ExtendedLength {
                                fin,
                                opcode,
                                bytes_needed: 2,
                            };
                        }
                        _ => {
                            self.state = DecodeState::ExtendedLength {
                                fin,
                                opcode,
                                bytes_needed: 8,
                            };
                        }
                    }
                }

                DecodeState::ExtendedLength {
                    fin,
                    opcode,
                    bytes_needed,
                } => {
                    if src.len() < *bytes_needed {
                        return Ok(None);
                    }

                    let payload_len = if *bytes_needed == 2 {
                        let bytes = src.split_to(2);
                        u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                    } else {
                        let bytes = src.split_to(8);
                        u64::from_be_bytes([
                            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                            bytes[7],
                        ])
                    };

                    if payload_len > MAX_PAYLOAD_LEN {
                        self.state = DecodeState::Header;
                        return Err(FrameError::PayloadTooLarge { size: payload_len });
                    }

                    self.state = DecodeState::Payload {
                        fin: *fin,
                        opcode: *opcode,
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    fin,
                    opcode,
                    payload_len,
                } => {
                    let payload_len = *payload_len as usize;
                    if src.len() < payload_len {
                        return Ok(None);
                    }

                    let payload = src.split_to(payload_len).freeze();
                    let fragment = Fragment {
                        fin: *fin,
                        opcode: *opcode,
                        payload,
                    };

                    self.state = DecodeState::Header;
                    return Ok(Some(fragment));
                }
            }
        }
    }
}

/// Blocking frame stream over a [`WireIo`] transport.
///
/// Owns the read buffer and the codec state; `get_frame` drives the wire
/// until a complete, reassembled frame is available or the deadline for the
/// first fragment passes.
pub struct FrameStream<W> {
    wire: W,
    codec: FrameCodec,
    read_buf: BytesMut,
}

impl<W: WireIo> FrameStream<W> {
    /// Create a frame stream over the given transport.
    #[must_use]
    pub fn new(wire: W) -> Self {
        Self {
            wire,
            codec: FrameCodec::new(),
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Read one frame, waiting at most `timeout` for it to start.
    ///
    /// `Ok(None)` is the no-data status: fewer than two header bytes arrived
    /// within the deadline. Partial input stays buffered and the next call
    /// resumes where this one left off. Once a fragmented message has
    /// started, subsequent fragments are awaited with the continuation
    /// timeout and a stall is a fatal error.
    pub fn get_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, FrameError> {
        let first = match self.read_fragment(timeout)? {
            Some(fragment) => fragment,
            None => return Ok(None),
        };

        if first.fin {
            return Ok(Some(Frame {
                opcode: first.opcode,
                payload: first.payload,
            }));
        }

        let opcode = first.opcode;
        let mut payload = BytesMut::from(first.payload.as_ref());
        loop {
            let next = self
                .read_fragment(CONTINUATION_TIMEOUT)?
                .ok_or(FrameError::ContinuationTimeout)?;
            if next.opcode != opcode {
                return Err(FrameError::FragmentOpcodeMismatch {
                    first: opcode,
                    got: next.opcode,
                });
            }
            payload.extend_from_slice(&next.payload);
            if next.fin {
                return Ok(Some(Frame {
                    opcode,
                    payload: payload.freeze(),
                }));
            }
        }
    }

    /// Write one frame. FIN=1 and MASK=0 always.
    ///
    /// Short frames go through the buffered send path and end with an
    /// explicit flush; payloads of 64 KiB and above bypass the coalescing
    /// buffer entirely.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let len = frame.payload.len();
        let mut header = [0u8; 10];
        header[0] = 0x80 | frame.opcode as u8;

        let header_len = if len < 126 {
            header[1] = len as u8;
            2
        } else if len < 65536 {
            header[1] = 126;
            header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            header[1] = 127;
            header[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if len >= 65536 {
            self.wire.send(&header[..header_len])?;
            self.wire.send_unbuffered(&frame.payload)?;
        } else {
            self.wire.send(&header[..header_len])?;
            self.wire.send(&frame.payload)?;
            self.wire.flush()?;
        }
        Ok(())
    }

    fn read_fragment(&mut self, timeout: Duration) -> Result<Option<Fragment>, FrameError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(fragment) = self.codec.decode(&mut self.read_buf)? {
                return Ok(Some(fragment));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut tmp = [0u8; 4096];
            match self.wire.recv(&mut tmp, deadline - now) {
                Ok(0) => {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => self.read_buf.extend_from_slice(&tmp[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Apply XOR masking to payload data.
///
/// The engine never masks on send; this exists for tests that play the
/// client role and need to exercise the masked-frame rejection path.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory wire: `feed` queues inbound bytes, `sent` collects output.
    #[derive(Default)]
    struct MemWire {
        incoming: VecDeque<u8>,
        pending: Vec<u8>,
        sent: Vec<u8>,
        unbuffered_writes: usize,
    }

    impl MemWire {
        fn feed(&mut self, bytes: &[u8]) {
            self.incoming.extend(bytes.iter().copied());
        }
    }

    impl WireIo for MemWire {
        fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            let n = buf.len().min(self.incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.incoming.pop_front().unwrap();
            }
            Ok(n)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            self.pending.extend_from_slice(buf);
            Ok(())
        }

        fn send_unbuffered(&mut self, buf: &[u8]) -> io::Result<()> {
            self.flush()?;
            self.unbuffered_writes += 1;
            self.sent.extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.sent.extend_from_slice(&self.pending);
            self.pending.clear();
            Ok(())
        }
    }

    fn stream_with(bytes: &[u8]) -> FrameStream<MemWire> {
        let mut wire = MemWire::default();
        wire.feed(bytes);
        FrameStream::new(wire)
    }

    /// Serialize a single unmasked fragment by hand.
    fn raw_fragment(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let first = if fin { 0x80 } else { 0x00 } | opcode as u8;
        out.push(first);
        let len = payload.len();
        if len < 126 {
            out.push(len as u8);
        } else if len < 65536 {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_opcode_from_u8_total() {
        for value in 0u8..=0x0F {
            let opcode = Opcode::from_u8(value);
            assert_eq!(opcode as u8, value);
        }
        // High bits are stripped.
        assert_eq!(Opcode::from_u8(0x81), Opcode::Text);
    }

    #[test]
    fn test_opcode_classes() {
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(Opcode::ConnectionClose.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(Opcode::Reserved3.is_reserved());
        assert!(Opcode::ReservedF.is_reserved());
        assert!(!Opcode::Binary.is_reserved());
    }

    #[test]
    fn test_roundtrip_sizes() {
        for size in [0usize, 1, 125, 126, 127, 65535, 65536, 1 << 20] {
            let payload = vec![0xA5u8; size];
            let frame = Frame::binary(payload.clone());

            let mut sender = FrameStream::new(MemWire::default());
            sender.send_frame(&frame).unwrap();
            sender.wire.flush().unwrap();
            let wire_bytes = std::mem::take(&mut sender.wire.sent);

            let mut receiver = stream_with(&wire_bytes);
            let parsed = receiver
                .get_frame(Duration::from_millis(50))
                .unwrap()
                .expect("frame");
            assert_eq!(parsed, frame, "size {size}");
        }
    }

    #[test]
    fn test_large_frame_bypasses_coalescing() {
        let frame = Frame::binary(vec![1u8; 65536]);
        let mut sender = FrameStream::new(MemWire::default());
        sender.send_frame(&frame).unwrap();
        assert_eq!(sender.wire.unbuffered_writes, 1);

        let frame = Frame::binary(vec![1u8; 100]);
        let mut sender = FrameStream::new(MemWire::default());
        sender.send_frame(&frame).unwrap();
        assert_eq!(sender.wire.unbuffered_writes, 0);
        // Short path flushed: header + payload already on the wire.
        assert_eq!(sender.wire.sent.len(), 2 + 100);
    }

    #[test]
    fn test_masked_frame_rejected() {
        // Text frame, MASK=1, length 3.
        let bytes = [0x81, 0x80 | 3, 0, 0, 0, 0, b'a', b'b', b'c'];
        let mut stream = stream_with(&bytes);
        let err = stream.get_frame(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, FrameError::MaskedFrame));
    }

    #[test]
    fn test_length_cap_rejected_before_payload() {
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        // No payload bytes at all: the cap must trip on the header alone.
        let mut stream = stream_with(&header);
        let err = stream.get_frame(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size } if size == MAX_PAYLOAD_LEN + 1
        ));
    }

    #[test]
    fn test_no_data_returns_none() {
        let mut stream = FrameStream::new(MemWire::default());
        let got = stream.get_frame(Duration::from_millis(1)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_partial_header_stays_buffered() {
        let mut stream = stream_with(&[0x81]);
        assert!(stream.get_frame(Duration::from_millis(1)).unwrap().is_none());

        // Second byte plus payload arrive later; the first byte was kept.
        stream.wire.feed(&[5, b'h', b'e', b'l', b'l', b'o']);
        let frame = stream
            .get_frame(Duration::from_millis(1))
            .unwrap()
            .expect("frame");
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn test_fragment_reassembly() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        for fragments in [2usize, 5, 64] {
            let chunk = payload.len() / fragments;
            let mut wire_bytes = Vec::new();
            for (i, part) in payload.chunks(chunk).enumerate() {
                let fin = (i + 1) * chunk >= payload.len();
                wire_bytes.extend_from_slice(&raw_fragment(fin, Opcode::Binary, part));
            }

            let mut stream = stream_with(&wire_bytes);
            let frame = stream
                .get_frame(Duration::from_millis(1))
                .unwrap()
                .expect("frame");
            assert_eq!(frame.opcode, Opcode::Binary);
            assert_eq!(frame.payload.as_ref(), &payload[..], "k={fragments}");
        }
    }

    #[test]
    fn test_fragment_opcode_mismatch_fatal() {
        let mut wire_bytes = raw_fragment(false, Opcode::Text, b"part1");
        wire_bytes.extend_from_slice(&raw_fragment(true, Opcode::Binary, b"part2"));

        let mut stream = stream_with(&wire_bytes);
        let err = stream.get_frame(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            FrameError::FragmentOpcodeMismatch {
                first: Opcode::Text,
                got: Opcode::Binary,
            }
        ));
    }

    #[test]
    fn test_reserved_opcode_propagated() {
        let wire_bytes = raw_fragment(true, Opcode::Reserved5, b"x");
        let mut stream = stream_with(&wire_bytes);
        let frame = stream
            .get_frame(Duration::from_millis(1))
            .unwrap()
            .expect("frame");
        assert_eq!(frame.opcode, Opcode::Reserved5);
    }

    #[test]
    fn test_eof_is_fatal() {
        struct Eof;
        impl WireIo for Eof {
            fn recv(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
                Ok(0)
            }
            fn send(&mut self, _buf: &[u8]) -> io::Result<()> {
                Ok(())
            }
            fn send_unbuffered(&mut self, _buf: &[u8]) -> io::Result<()> {
                Ok(())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut stream = FrameStream::new(Eof);
        let err = stream.get_frame(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn test_apply_mask_is_involution() {
        let mask_key = [0x37, 0xfa, 0x21, 0x3d];
        let mut payload = b"Hello".to_vec();
        let original = payload.clone();

        apply_mask(&mut payload, mask_key);
        assert_ne!(payload, original);
        apply_mask(&mut payload, mask_key);
        assert_eq!(payload, original);
    }
}
