//! # Telemetry Framing
//!
//! Minimal MAVLink framing: enough to split a byte stream into frames, read the
//! routing fields, check signatures and emit the handful of messages the relay
//! originates itself. Payloads are otherwise opaque.
//!
//! ## Wire Formats
//!
//! | Version | STX | Header | Message id |
//! |---------|-----|--------|------------|
//! | v1 | `0xFE` | len, seq, sysid, compid, msgid | 1 byte |
//! | v2 | `0xFD` | len, incompat, compat, seq, sysid, compid, msgid | 3 bytes LE |
//!
//! Every frame ends with a 16-bit X.25 CRC over everything after STX, seeded
//! with a per-message `crc_extra`. A v2 frame with incompat bit 0 set carries a
//! 13-byte signature trailer: `link_id(1) | timestamp(6 LE) | signature(6)`.
//!
//! ## Validation
//!
//! | Message id | CRC rule |
//! |------------|----------|
//! | in [`crc_extra`] | must match with the table seed |
//! | anything else | must match with *some* seed byte, which is then known |
//!
//! The final CRC step is a bijection on the seed byte, so at most one seed fits
//! a given frame. A stray STX that is not a frame start passes the second rule
//! with odds of 1 in 256. Recovering the seed is also what lets the relay
//! re-sign or strip frames it cannot otherwise decode.

use thiserror::Error;

use crate::crypto::{SIGNATURE_LEN, compute_signature};
use crate::record::SECRET_KEY_LEN;

// ============================================================================
// Constants
// ============================================================================

pub const STX_V1: u8 = 0xFE;
pub const STX_V2: u8 = 0xFD;

const HEADER_LEN_V1: usize = 6;
const HEADER_LEN_V2: usize = 10;
const CRC_LEN: usize = 2;

/// Signature trailer: link id, 6-byte timestamp, 6-byte signature.
pub const SIGNATURE_BLOCK_LEN: usize = 13;

/// incompat_flags bit marking a signed v2 frame.
pub const IFLAG_SIGNED: u8 = 0x01;

pub const MAX_PAYLOAD_LEN: usize = 255;

/// Largest possible frame (signed v2 with a full payload).
pub const MAX_FRAME_LEN: usize = HEADER_LEN_V2 + MAX_PAYLOAD_LEN + CRC_LEN + SIGNATURE_BLOCK_LEN;

pub const MSG_ID_HEARTBEAT: u32 = 0;
pub const MSG_ID_SYSTEM_TIME: u32 = 2;
pub const MSG_ID_STATUSTEXT: u32 = 253;
pub const MSG_ID_SETUP_SIGNING: u32 = 256;

pub const SEVERITY_CRITICAL: u8 = 2;

/// Width of the STATUSTEXT text field.
pub const STATUSTEXT_TEXT_LEN: usize = 50;

const SETUP_SIGNING_LEN: usize = 42;

/// CRC seed for the messages this crate understands.
pub fn crc_extra(msg_id: u32) -> Option<u8> {
    match msg_id {
        MSG_ID_HEARTBEAT => Some(50),
        MSG_ID_SYSTEM_TIME => Some(137),
        MSG_ID_STATUSTEXT => Some(83),
        MSG_ID_SETUP_SIGNING => Some(71),
        _ => None,
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the 255 byte limit")]
    PayloadTooLong(usize),
    #[error("no CRC seed known for message id {0}")]
    UnknownMessage(u32),
    #[error("message id {0} does not fit in a v2 frame")]
    MessageIdOutOfRange(u32),
    #[error("frame is message {actual}, expected {expected}")]
    WrongMessage { expected: u32, actual: u32 },
}

// ============================================================================
// CRC
// ============================================================================

/// X.25 (MCRF4XX) accumulation step.
fn crc_accumulate(byte: u8, crc: u16) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    let tmp = u16::from(tmp);
    (crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4)
}

pub fn crc_x25(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &b| crc_accumulate(b, crc))
}

fn frame_crc(body: &[u8], extra: u8) -> u16 {
    crc_accumulate(extra, crc_x25(body))
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

/// Signature trailer of a signed v2 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBlock {
    pub link_id: u8,
    pub timestamp: u64,
    pub signature: [u8; SIGNATURE_LEN],
}

/// One complete frame, kept as its original bytes so forwarding is a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    version: Version,
    bytes: Vec<u8>,
}

impl Frame {
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn header_len(&self) -> usize {
        match self.version {
            Version::V1 => HEADER_LEN_V1,
            Version::V2 => HEADER_LEN_V2,
        }
    }

    pub fn msg_id(&self) -> u32 {
        match self.version {
            Version::V1 => u32::from(self.bytes[5]),
            Version::V2 => u32::from_le_bytes([self.bytes[7], self.bytes[8], self.bytes[9], 0]),
        }
    }

    pub fn seq(&self) -> u8 {
        match self.version {
            Version::V1 => self.bytes[2],
            Version::V2 => self.bytes[4],
        }
    }

    pub fn sysid(&self) -> u8 {
        match self.version {
            Version::V1 => self.bytes[3],
            Version::V2 => self.bytes[5],
        }
    }

    pub fn compid(&self) -> u8 {
        match self.version {
            Version::V1 => self.bytes[4],
            Version::V2 => self.bytes[6],
        }
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.header_len();
        &self.bytes[start..self.body_len()]
    }

    /// Header plus payload.
    fn body_len(&self) -> usize {
        self.header_len() + usize::from(self.bytes[1])
    }

    fn crc(&self) -> u16 {
        let at = self.body_len();
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    /// CRC seed this frame was built with, if its CRC is consistent.
    fn seed(&self) -> Option<u8> {
        let partial = crc_x25(&self.bytes[1..self.body_len()]);
        let actual = self.crc();
        match crc_extra(self.msg_id()) {
            Some(extra) => (crc_accumulate(extra, partial) == actual).then_some(extra),
            None => (0..=u8::MAX).find(|&extra| crc_accumulate(extra, partial) == actual),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.version == Version::V2 && self.bytes[2] & IFLAG_SIGNED != 0
    }

    pub fn signature(&self) -> Option<SignatureBlock> {
        if !self.is_signed() {
            return None;
        }
        let block = &self.bytes[self.bytes.len() - SIGNATURE_BLOCK_LEN..];
        let mut ts = [0u8; 8];
        ts[..6].copy_from_slice(&block[1..7]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&block[7..]);
        Some(SignatureBlock {
            link_id: block[0],
            timestamp: u64::from_le_bytes(ts),
            signature,
        })
    }

    /// Bytes covered by the signature: everything before the signature field.
    pub fn signed_region(&self) -> Option<&[u8]> {
        self.is_signed()
            .then(|| &self.bytes[..self.bytes.len() - SIGNATURE_LEN])
    }

    /// The same message signed with `signing`. `None` for v1 frames, which
    /// cannot carry a signature.
    pub fn signed_with(&self, signing: &SigningParams<'_>) -> Option<Frame> {
        self.reframe(Some(signing))
    }

    /// The same message without a signature trailer.
    pub fn without_signature(self) -> Frame {
        if !self.is_signed() {
            return self;
        }
        match self.reframe(None) {
            Some(frame) => frame,
            None => self,
        }
    }

    fn reframe(&self, signing: Option<&SigningParams<'_>>) -> Option<Frame> {
        if self.version != Version::V2 {
            return None;
        }
        let extra = self.seed()?;
        let mut body = Vec::with_capacity(MAX_FRAME_LEN);
        body.extend_from_slice(&self.bytes[..self.body_len()]);
        if signing.is_some() {
            body[2] |= IFLAG_SIGNED;
        } else {
            body[2] &= !IFLAG_SIGNED;
        }
        Some(seal(body, extra, signing))
    }
}

// ============================================================================
// Stream Parser
// ============================================================================

/// Incremental parser that resynchronises on STX after garbage or bad CRCs.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    dropped: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while hunting for a valid frame start.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Treat the buffered bytes as final: a partial frame left at the end is
    /// dropped one byte at a time so any frames it swallowed are recovered.
    pub fn flush(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !self.buf.is_empty() {
            self.discard(1);
            frames.extend(self.push(&[]));
        }
        frames
    }

    /// Feed bytes and return every frame completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == STX_V1 || b == STX_V2) else {
                self.discard(self.buf.len());
                break;
            };
            self.discard(start);

            match self.try_frame() {
                Attempt::Complete(frame) => frames.push(frame),
                Attempt::Incomplete => break,
                // Skip this STX and hunt for the next one.
                Attempt::Invalid => self.discard(1),
            }
        }
        frames
    }

    fn discard(&mut self, n: usize) {
        self.dropped += n as u64;
        self.buf.drain(..n);
    }

    fn try_frame(&mut self) -> Attempt {
        let version = if self.buf[0] == STX_V2 { Version::V2 } else { Version::V1 };
        let header_len = match version {
            Version::V1 => HEADER_LEN_V1,
            Version::V2 => HEADER_LEN_V2,
        };
        if self.buf.len() < header_len {
            return Attempt::Incomplete;
        }
        let payload_len = usize::from(self.buf[1]);
        let signed = version == Version::V2 && self.buf[2] & IFLAG_SIGNED != 0;
        let body_len = header_len + payload_len;
        let total = body_len + CRC_LEN + if signed { SIGNATURE_BLOCK_LEN } else { 0 };
        if self.buf.len() < total {
            return Attempt::Incomplete;
        }

        let frame = Frame { version, bytes: self.buf[..total].to_vec() };
        if frame.seed().is_none() {
            return Attempt::Invalid;
        }
        self.buf.drain(..total);
        Attempt::Complete(frame)
    }
}

enum Attempt {
    Complete(Frame),
    Incomplete,
    Invalid,
}

/// Parse a self-contained datagram. Partial trailing frames are discarded.
pub fn parse_datagram(data: &[u8]) -> Vec<Frame> {
    let mut parser = FrameParser::new();
    let mut frames = parser.push(data);
    frames.extend(parser.flush());
    frames
}

// ============================================================================
// Encoding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_id: u32,
    pub sysid: u8,
    pub compid: u8,
    pub seq: u8,
}

/// Key material for signing an outgoing frame.
#[derive(Clone, Copy)]
pub struct SigningParams<'a> {
    pub secret: &'a [u8; SECRET_KEY_LEN],
    pub link_id: u8,
    pub timestamp: u64,
}

/// Build an unsigned v2 frame.
pub fn encode_v2(header: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
    encode(header, payload, None)
}

/// Build a signed v2 frame.
pub fn encode_v2_signed(
    header: &FrameHeader,
    payload: &[u8],
    signing: &SigningParams<'_>,
) -> Result<Frame, FrameError> {
    encode(header, payload, Some(signing))
}

fn encode(
    header: &FrameHeader,
    payload: &[u8],
    signing: Option<&SigningParams<'_>>,
) -> Result<Frame, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }
    if header.msg_id > 0x00FF_FFFF {
        return Err(FrameError::MessageIdOutOfRange(header.msg_id));
    }
    let extra = crc_extra(header.msg_id).ok_or(FrameError::UnknownMessage(header.msg_id))?;

    // v2 drops trailing zero bytes but always keeps the first payload byte.
    let trimmed = payload.iter().rposition(|&b| b != 0).map_or(1, |i| i + 1);
    let payload = &payload[..trimmed.min(payload.len())];

    let id = header.msg_id.to_le_bytes();
    let mut body = Vec::with_capacity(MAX_FRAME_LEN);
    body.extend_from_slice(&[
        STX_V2,
        payload.len() as u8,
        if signing.is_some() { IFLAG_SIGNED } else { 0 },
        0,
        header.seq,
        header.sysid,
        header.compid,
        id[0],
        id[1],
        id[2],
    ]);
    body.extend_from_slice(payload);
    Ok(seal(body, extra, signing))
}

/// Append CRC and, when signing, the signature trailer to a v2 header and
/// payload. The incompat flags in `bytes` must already match `signing`.
fn seal(mut bytes: Vec<u8>, extra: u8, signing: Option<&SigningParams<'_>>) -> Frame {
    let crc = frame_crc(&bytes[1..], extra);
    bytes.extend_from_slice(&crc.to_le_bytes());

    if let Some(signing) = signing {
        bytes.push(signing.link_id);
        bytes.extend_from_slice(&signing.timestamp.to_le_bytes()[..6]);
        let signature = compute_signature(signing.secret, &bytes);
        bytes.extend_from_slice(&signature);
    }

    Frame { version: Version::V2, bytes }
}

// ============================================================================
// Relay-Originated Messages
// ============================================================================

/// STATUSTEXT carrying `text` (cut to the field width), unsigned.
pub fn statustext(sysid: u8, compid: u8, severity: u8, text: &str) -> Frame {
    let mut payload = [0u8; 1 + STATUSTEXT_TEXT_LEN + 3];
    payload[0] = severity;
    let text = text.as_bytes();
    let len = text.len().min(STATUSTEXT_TEXT_LEN);
    payload[1..1 + len].copy_from_slice(&text[..len]);

    let header = FrameHeader { msg_id: MSG_ID_STATUSTEXT, sysid, compid, seq: 0 };
    match encode(&header, &payload, None) {
        Ok(frame) => frame,
        // Fixed id and payload size; encoding cannot fail.
        Err(e) => unreachable!("statustext encoding failed: {e}"),
    }
}

/// Text of a STATUSTEXT frame, if it is one.
pub fn statustext_text(frame: &Frame) -> Option<String> {
    if frame.msg_id() != MSG_ID_STATUSTEXT {
        return None;
    }
    let payload = frame.payload();
    let field = payload.get(1..).unwrap_or_default();
    let field = &field[..field.len().min(STATUSTEXT_TEXT_LEN)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Decoded SETUP_SIGNING request.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupSigning {
    pub initial_timestamp: u64,
    pub target_system: u8,
    pub target_component: u8,
    pub secret_key: [u8; SECRET_KEY_LEN],
}

impl std::fmt::Debug for SetupSigning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupSigning")
            .field("initial_timestamp", &self.initial_timestamp)
            .field("target_system", &self.target_system)
            .field("target_component", &self.target_component)
            .finish_non_exhaustive()
    }
}

impl SetupSigning {
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        if frame.msg_id() != MSG_ID_SETUP_SIGNING {
            return Err(FrameError::WrongMessage {
                expected: MSG_ID_SETUP_SIGNING,
                actual: frame.msg_id(),
            });
        }
        // Restore trailing zeros dropped on the wire.
        let mut payload = [0u8; SETUP_SIGNING_LEN];
        let src = frame.payload();
        let n = src.len().min(SETUP_SIGNING_LEN);
        payload[..n].copy_from_slice(&src[..n]);

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[0..8]);
        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&payload[10..42]);
        Ok(Self {
            initial_timestamp: u64::from_le_bytes(ts),
            target_system: payload[8],
            target_component: payload[9],
            secret_key,
        })
    }

    pub fn to_payload(&self) -> [u8; SETUP_SIGNING_LEN] {
        let mut payload = [0u8; SETUP_SIGNING_LEN];
        payload[0..8].copy_from_slice(&self.initial_timestamp.to_le_bytes());
        payload[8] = self.target_system;
        payload[9] = self.target_component;
        payload[10..42].copy_from_slice(&self.secret_key);
        payload
    }
}

/// HEARTBEAT payload for tests and keepalives: all-zero except `mavlink_version`.
pub fn heartbeat_payload() -> [u8; 9] {
    let mut payload = [0u8; 9];
    payload[8] = 3;
    payload
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_secret, verify_signature};

    fn header(msg_id: u32) -> FrameHeader {
        FrameHeader { msg_id, sysid: 1, compid: 1, seq: 7 }
    }

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc_x25(b"123456789"), 0x6F91);
    }

    #[test]
    fn test_encode_heartbeat_fields() {
        let frame = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        assert_eq!(frame.as_bytes()[0], STX_V2);
        assert_eq!(frame.msg_id(), MSG_ID_HEARTBEAT);
        assert_eq!((frame.sysid(), frame.compid(), frame.seq()), (1, 1, 7));
        assert_eq!(frame.payload(), &heartbeat_payload()[..]);
        assert!(!frame.is_signed());
        assert!(frame.signature().is_none());
    }

    #[test]
    fn test_trailing_zeros_truncated() {
        let frame = encode_v2(&header(MSG_ID_SYSTEM_TIME), &[5, 0, 0, 0]).unwrap();
        assert_eq!(frame.payload(), &[5]);
        let frame = encode_v2(&header(MSG_ID_SYSTEM_TIME), &[0, 0, 0]).unwrap();
        assert_eq!(frame.payload(), &[0]);
    }

    #[test]
    fn test_encode_rejects_unknown_and_oversized() {
        assert_eq!(encode_v2(&header(9999), &[1]), Err(FrameError::UnknownMessage(9999)));
        assert_eq!(
            encode_v2(&header(MSG_ID_HEARTBEAT), &[1u8; 256]),
            Err(FrameError::PayloadTooLong(256))
        );
    }

    #[test]
    fn test_signed_frame_verifies() {
        let secret = derive_secret("pass");
        let signing = SigningParams { secret: &secret, link_id: 3, timestamp: 0x0000_1122_3344_5566 };
        let frame = encode_v2_signed(&header(MSG_ID_HEARTBEAT), &heartbeat_payload(), &signing).unwrap();

        let block = frame.signature().unwrap();
        assert_eq!(block.link_id, 3);
        assert_eq!(block.timestamp, 0x1122_3344_5566);
        assert!(verify_signature(&secret, frame.signed_region().unwrap(), &block.signature));

        let parsed = parse_datagram(frame.as_bytes());
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn test_parser_handles_split_and_garbage() {
        let a = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        let b = statustext(1, 1, SEVERITY_CRITICAL, "hello");
        let mut stream = vec![0x00, 0x42];
        stream.extend_from_slice(a.as_bytes());
        stream.extend_from_slice(b.as_bytes());

        let mut parser = FrameParser::new();
        let (first, second) = stream.split_at(7);
        assert!(parser.push(first).is_empty());
        let frames = parser.push(second);
        assert_eq!(frames, vec![a, b]);
        assert_eq!(parser.dropped(), 2);
    }

    #[test]
    fn test_parser_skips_bad_crc() {
        let good = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        let mut bad = good.as_bytes().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend_from_slice(good.as_bytes());
        assert_eq!(parse_datagram(&bad), vec![good]);
    }

    /// v1 frame, msgid 30, seeded with 39.
    const UNKNOWN_V1: [u8; 10] = [STX_V1, 2, 9, 1, 1, 30, 0xAA, 0xBB, 0x80, 0xA3];

    #[test]
    fn test_unknown_message_crc_recovered() {
        let frames = parse_datagram(&UNKNOWN_V1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].version(), Version::V1);
        assert_eq!(frames[0].msg_id(), 30);
        assert_eq!(frames[0].seq(), 9);
        assert_eq!(frames[0].payload(), &[0xAA, 0xBB]);
        assert_eq!(frames[0].seed(), Some(39));

        let mut corrupt = UNKNOWN_V1;
        corrupt[8..].copy_from_slice(&[0x12, 0x34]);
        assert!(parse_datagram(&corrupt).is_empty());
    }

    #[test]
    fn test_stray_stx_does_not_swallow_stream() {
        let good = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        let mut stream = vec![STX_V2, 0x30];
        for _ in 0..4 {
            stream.extend_from_slice(good.as_bytes());
        }

        let mut parser = FrameParser::new();
        assert_eq!(parser.push(&stream), vec![good.clone(); 4]);
        assert_eq!(parser.dropped(), 2);
    }

    #[test]
    fn test_datagram_recovers_after_truncated_stray() {
        let good = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        let mut datagram = vec![STX_V2, 0xC8];
        datagram.extend_from_slice(good.as_bytes());
        assert_eq!(parse_datagram(&datagram), vec![good]);
    }

    #[test]
    fn test_resign_and_strip_unknown_message() {
        let secret = derive_secret("pass");
        // v2 frame with an id outside the table, seeded with 39.
        let mut body = vec![STX_V2, 3, 0, 0, 4, 1, 1, 30, 0, 0, 0x10, 0x20, 0x30];
        let crc = frame_crc(&body[1..], 39);
        body.extend_from_slice(&crc.to_le_bytes());
        let original = parse_datagram(&body).remove(0);

        let signing = SigningParams { secret: &secret, link_id: 0, timestamp: 77 };
        let signed = original.signed_with(&signing).unwrap();
        assert!(signed.is_signed());
        assert_eq!(signed.payload(), original.payload());
        assert_eq!((signed.msg_id(), signed.seq(), signed.sysid()), (30, 4, 1));
        let block = signed.signature().unwrap();
        assert_eq!(block.timestamp, 77);
        assert!(verify_signature(&secret, signed.signed_region().unwrap(), &block.signature));
        assert_eq!(parse_datagram(signed.as_bytes()), vec![signed.clone()]);

        assert_eq!(signed.without_signature(), original);
    }

    #[test]
    fn test_v1_frames_cannot_be_signed() {
        let secret = derive_secret("pass");
        let frame = parse_datagram(&UNKNOWN_V1).remove(0);
        let signing = SigningParams { secret: &secret, link_id: 0, timestamp: 1 };
        assert!(frame.signed_with(&signing).is_none());
        assert_eq!(frame.clone().without_signature(), frame);
    }

    #[test]
    fn test_statustext_text_is_cut() {
        let long = "x".repeat(80);
        let frame = statustext(1, 1, SEVERITY_CRITICAL, &long);
        assert_eq!(frame.payload()[0], SEVERITY_CRITICAL);
        assert_eq!(statustext_text(&frame).unwrap(), "x".repeat(STATUSTEXT_TEXT_LEN));
    }

    #[test]
    fn test_setup_signing_decode() {
        let request = SetupSigning {
            initial_timestamp: 123_456,
            target_system: 1,
            target_component: 0,
            secret_key: [0x5A; SECRET_KEY_LEN],
        };
        let frame = encode_v2(&header(MSG_ID_SETUP_SIGNING), &request.to_payload()).unwrap();
        assert_eq!(SetupSigning::decode(&frame).unwrap(), request);

        let heartbeat = encode_v2(&header(MSG_ID_HEARTBEAT), &heartbeat_payload()).unwrap();
        assert!(matches!(
            SetupSigning::decode(&heartbeat),
            Err(FrameError::WrongMessage { expected: MSG_ID_SETUP_SIGNING, actual: 0 })
        ));
    }
}
