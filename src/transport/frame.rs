//! WebSocket frame codec (RFC 6455 section 5).
//!
//! Decoding is incremental: bytes are appended to a growable buffer and a
//! frame is only consumed once all of it has arrived.

use bytes::{Buf, Bytes, BytesMut};

use super::ProtocolError;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Default cap on a single frame or reassembled message.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded (already unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

/// Incremental frame decoder over a growable receive buffer.
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_payload,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & RSV_BITS != 0 {
            return Err(ProtocolError::ReservedBits);
        }
        let fin = b0 & FIN_BIT != 0;
        let raw_opcode = b0 & OPCODE_MASK;
        let opcode = OpCode::from_u8(raw_opcode).ok_or(ProtocolError::ReservedOpcode(raw_opcode))?;

        let masked = b1 & MASK_BIT != 0;
        let mut offset = 2usize;
        let payload_len = match b1 & LEN_MASK {
            LEN_16 => {
                if self.buf.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64;
                offset += 2;
                len
            }
            LEN_64 => {
                if self.buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                offset += 8;
                u64::from_be_bytes(raw)
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlTooLarge);
            }
        }
        if payload_len > self.max_payload as u64 {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        let payload_len = payload_len as usize;

        let mask_key = if masked {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if self.buf.len() < offset + payload_len {
            self.buf.reserve(offset + payload_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(offset);
        let mut payload = self.buf.split_to(payload_len);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

/// XOR `buf` in place with the 4-byte masking key.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a client frame, masked with a fresh random key.
pub fn encode_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    use rand::Rng;
    let mut key = [0u8; 4];
    rand::thread_rng().fill(&mut key);
    encode_frame_with_key(opcode, payload, fin, key)
}

pub fn encode_frame_with_key(opcode: OpCode, payload: &[u8], fin: bool, key: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(if fin { FIN_BIT } else { 0 } | opcode.as_u8());

    if payload.len() < LEN_16 as usize {
        frame.push(MASK_BIT | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(MASK_BIT | LEN_16);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(MASK_BIT | LEN_64);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    frame.extend_from_slice(&key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], key);
    frame
}

/// Close frame payload: 2-byte code followed by a UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut reason_bytes = reason.as_bytes();
    // Keep the whole control frame within 125 bytes.
    if reason_bytes.len() > MAX_CONTROL_PAYLOAD - 2 {
        let mut cut = MAX_CONTROL_PAYLOAD - 2;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason_bytes = &reason_bytes[..cut];
    }
    let mut payload = Vec::with_capacity(2 + reason_bytes.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason_bytes);
    payload
}

/// Parse a close frame payload. An empty payload means "no status" (1005).
pub fn parse_close(payload: &[u8]) -> Result<(u16, String), ProtocolError> {
    match payload.len() {
        0 => Ok((1005, String::new())),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            Ok((code, reason))
        }
    }
}

/// A reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Reassembles fragmented data frames into messages.
pub struct MessageAssembler {
    kind: Option<OpCode>,
    parts: BytesMut,
    max_message: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl MessageAssembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            kind: None,
            parts: BytesMut::new(),
            max_message,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.kind.is_some()
    }

    /// Feed one data frame; yields a message once its final fragment arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.kind.is_some() {
                    return Err(ProtocolError::InterleavedDataFrame);
                }
                if frame.fin {
                    return finish(frame.opcode, frame.payload).map(Some);
                }
                self.kind = Some(frame.opcode);
                self.parts.clear();
                self.parts.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let Some(kind) = self.kind else {
                    return Err(ProtocolError::UnexpectedContinuation);
                };
                if self.parts.len() + frame.payload.len() > self.max_message {
                    return Err(ProtocolError::PayloadTooLarge(
                        (self.parts.len() + frame.payload.len()) as u64,
                    ));
                }
                self.parts.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                self.kind = None;
                let whole = std::mem::take(&mut self.parts).freeze();
                finish(kind, whole).map(Some)
            }
            // Control frames never reach the assembler.
            _ => Ok(None),
        }
    }
}

fn finish(kind: OpCode, payload: Bytes) -> Result<Message, ProtocolError> {
    match kind {
        OpCode::Text => String::from_utf8(payload.to_vec())
            .map(Message::Text)
            .map_err(|_| ProtocolError::InvalidUtf8),
        _ => Ok(Message::Binary(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server-side frame (unmasked), as a node would send it.
    fn server_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut frame = vec![if fin { FIN_BIT } else { 0 } | opcode.as_u8()];
        if payload.len() < 126 {
            frame.push(payload.len() as u8);
        } else if payload.len() <= u16::MAX as usize {
            frame.push(126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(payload);
        frame
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(server_frame(OpCode::Text, br#"{"op":"ready"}"#, true));
        stream.extend(server_frame(OpCode::Text, b"hel", false));
        stream.extend(server_frame(OpCode::Ping, b"hb", true));
        stream.extend(server_frame(OpCode::Continuation, b"lo ", false));
        stream.extend(server_frame(OpCode::Continuation, b"world", true));
        stream.extend(server_frame(OpCode::Binary, &vec![7u8; 300], true));
        stream.extend(server_frame(OpCode::Text, &vec![b'x'; 70_000], true));
        stream
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Msg(Message),
        Ping(Bytes),
    }

    fn drain(decoder: &mut FrameDecoder, assembler: &mut MessageAssembler, out: &mut Vec<Seen>) {
        while let Some(frame) = decoder.next_frame().unwrap() {
            if frame.opcode == OpCode::Ping {
                out.push(Seen::Ping(frame.payload));
                continue;
            }
            if let Some(msg) = assembler.push(frame).unwrap() {
                out.push(Seen::Msg(msg));
            }
        }
    }

    fn feed_in_chunks(stream: &[u8], chunk: usize) -> Vec<Seen> {
        let mut decoder = FrameDecoder::default();
        let mut assembler = MessageAssembler::default();
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.extend(piece);
            drain(&mut decoder, &mut assembler, &mut out);
        }
        assert_eq!(decoder.buffered(), 0);
        out
    }

    #[test]
    fn test_reassembly_is_independent_of_chunking() {
        let stream = sample_stream();
        let whole = feed_in_chunks(&stream, stream.len());
        assert_eq!(whole.len(), 5);
        assert_eq!(
            whole[0],
            Seen::Msg(Message::Text(r#"{"op":"ready"}"#.to_string()))
        );
        assert_eq!(whole[1], Seen::Ping(Bytes::from_static(b"hb")));
        assert_eq!(whole[2], Seen::Msg(Message::Text("hello world".to_string())));

        for chunk in [1, 2, 3, 7, 125, 126, 4096] {
            assert_eq!(feed_in_chunks(&stream, chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_client_frames_are_masked() {
        for len in [0usize, 5, 125, 126, 65_535, 65_536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(OpCode::Binary, &payload, true);
            assert_eq!(frame[1] & MASK_BIT, MASK_BIT, "mask bit for len {}", len);

            let mut decoder = FrameDecoder::default();
            decoder.extend(&frame);
            let decoded = decoder.next_frame().unwrap().unwrap();
            assert_eq!(decoded.payload.as_ref(), payload.as_slice());
            assert!(decoded.fin);
        }
    }

    #[test]
    fn test_masking_with_known_key() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let frame = encode_frame_with_key(OpCode::Text, b"Hello", true, key);
        // Example from RFC 6455 section 5.7.
        assert_eq!(
            frame,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_extended_length_headers() {
        let frame = encode_frame(OpCode::Binary, &vec![0u8; 126], true);
        assert_eq!(frame[1] & LEN_MASK, 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 126);

        let frame = encode_frame(OpCode::Binary, &vec![0u8; 65_536], true);
        assert_eq!(frame[1] & LEN_MASK, 127);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame[2..10]);
        assert_eq!(u64::from_be_bytes(raw), 65_536);
    }

    #[test]
    fn test_new_data_frame_during_fragmentation_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let start = Frame {
            fin: false,
            opcode: OpCode::Text,
            payload: Bytes::from_static(b"a"),
        };
        assert_eq!(assembler.push(start.clone()).unwrap(), None);
        assert_eq!(
            assembler.push(start),
            Err(ProtocolError::InterleavedDataFrame)
        );
    }

    #[test]
    fn test_stray_continuation_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let frame = Frame {
            fin: true,
            opcode: OpCode::Continuation,
            payload: Bytes::new(),
        };
        assert_eq!(
            assembler.push(frame),
            Err(ProtocolError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_control_frame_rules() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&server_frame(OpCode::Ping, b"x", false));
        assert_eq!(decoder.next_frame(), Err(ProtocolError::FragmentedControl));

        let mut decoder = FrameDecoder::default();
        decoder.extend(&server_frame(OpCode::Ping, &[0u8; 126], true));
        assert_eq!(decoder.next_frame(), Err(ProtocolError::ControlTooLarge));
    }

    #[test]
    fn test_reserved_opcode_and_bits() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0x83, 0x00]);
        assert_eq!(decoder.next_frame(), Err(ProtocolError::ReservedOpcode(3)));

        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0xC1, 0x00]);
        assert_eq!(decoder.next_frame(), Err(ProtocolError::ReservedBits));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_buffering() {
        let mut decoder = FrameDecoder::new(1024);
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(1u64 << 40).to_be_bytes());
        decoder.extend(&header);
        assert_eq!(
            decoder.next_frame(),
            Err(ProtocolError::PayloadTooLarge(1u64 << 40))
        );
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let payload = close_payload(4001, "bye");
        assert_eq!(parse_close(&payload).unwrap(), (4001, "bye".to_string()));
        assert_eq!(parse_close(&[]).unwrap(), (1005, String::new()));
        assert_eq!(parse_close(&[3]), Err(ProtocolError::InvalidClosePayload));

        let long = "é".repeat(100);
        assert!(close_payload(1000, &long).len() <= MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let frame = Frame {
            fin: true,
            opcode: OpCode::Text,
            payload: Bytes::from_static(&[0xff, 0xfe]),
        };
        assert_eq!(assembler.push(frame), Err(ProtocolError::InvalidUtf8));
    }
}
