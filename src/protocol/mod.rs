//! Wire codec for datapath <-> agent messages.
//!
//! Every frame starts with a 6-byte packed header followed by a kind-specific
//! body. All integers are little-endian and nothing is padded; offsets are
//! written explicitly rather than relying on struct layout.
//!
//! ```text
//! +------+-----+----------------+---------------------+
//! | kind | len | handle (u32)   | body ...            |
//! | u8   | u8  | little-endian  | len - 6 bytes       |
//! +------+-----+----------------+---------------------+
//! ```
//!
//! `len` is the total frame length, header included, so a buffer holding
//! several frames back to back can be walked with [`Frames`].
//!
//! | Kind | Body |
//! |------|------|
//! | Create (0) | `start_seq: u32`, NUL-terminated algorithm name |
//! | Measure (1) | `ack: u32, rtt: u32, loss: u32, rate_in: u64, rate_out: u64` |
//! | Drop (2) | NUL-terminated reason: `timeout`, `dupack` or `ecn` |
//! | Pattern (3) | `num_events: u32`, then packed events |
//! | Instruction (4) | `opcode, dest, left, right` |

pub mod instruction;
pub mod pattern;

use arrayvec::{ArrayString, ArrayVec};

pub use instruction::{Instruction, Opcode, Primitive, Register};
pub use pattern::{PatternEvent, MAX_PATTERN_EVENTS};

use crate::{Error, Result};

pub const HEADER_LEN: usize = 6;
/// Largest frame expressible in the `u8` length field.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;
/// Longest string body, terminator included.
pub const MAX_STRING_LEN: usize = 250;
pub const MEASURE_BODY_LEN: usize = 28;

const KIND_OFFSET: usize = 0;
const LEN_OFFSET: usize = 1;
const HANDLE_OFFSET: usize = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Create = 0,
    Measure = 1,
    Drop = 2,
    Pattern = 3,
    Instruction = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageKind::Create,
            1 => MessageKind::Measure,
            2 => MessageKind::Drop,
            3 => MessageKind::Pattern,
            4 => MessageKind::Instruction,
            other => return Err(Error::UnknownKind(other)),
        })
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub len: u8,
    pub handle: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[KIND_OFFSET] = self.kind.as_u8();
        buf[LEN_OFFSET] = self.len;
        buf[HANDLE_OFFSET..HANDLE_OFFSET + 4].copy_from_slice(&self.handle.to_le_bytes());
        buf
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        (self.len as usize).saturating_sub(HEADER_LEN)
    }
}

/// Congestion signal that triggered a Drop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropKind {
    Timeout,
    Dupack,
    Ecn,
}

impl DropKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DropKind::Timeout => "timeout",
            DropKind::Dupack => "dupack",
            DropKind::Ecn => "ecn",
        }
    }

    pub fn parse(reason: &str) -> Result<Self> {
        match reason {
            "timeout" => Ok(DropKind::Timeout),
            "dupack" => Ok(DropKind::Dupack),
            "ecn" => Ok(DropKind::Ecn),
            _ => Err(Error::Malformed("unknown drop reason")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create {
    pub start_seq: u32,
    pub algorithm: ArrayString<MAX_STRING_LEN>,
}

impl Create {
    pub fn new(start_seq: u32, algorithm: &str) -> Result<Self> {
        check_wire_string(algorithm)?;
        let mut name = ArrayString::new();
        name.push_str(algorithm);
        Ok(Self {
            start_seq,
            algorithm: name,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measure {
    pub ack: u32,
    pub rtt: u32,
    pub loss: u32,
    pub rate_in: u64,
    pub rate_out: u64,
}

pub type Pattern = ArrayVec<PatternEvent, MAX_PATTERN_EVENTS>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Create(Create),
    Measure(Measure),
    Drop(DropKind),
    Pattern(Pattern),
    Instruction(Instruction),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Create(_) => MessageKind::Create,
            Message::Measure(_) => MessageKind::Measure,
            Message::Drop(_) => MessageKind::Drop,
            Message::Pattern(_) => MessageKind::Pattern,
            Message::Instruction(_) => MessageKind::Instruction,
        }
    }

    /// Total encoded frame length, header included.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Message::Create(create) => 4 + create.algorithm.len() + 1,
            Message::Measure(_) => MEASURE_BODY_LEN,
            Message::Drop(kind) => kind.as_str().len() + 1,
            Message::Pattern(events) => {
                4 + events.iter().map(PatternEvent::encoded_len).sum::<usize>()
            }
            Message::Instruction(_) => instruction::INSTRUCTION_LEN,
        };
        HEADER_LEN + body
    }
}

/// A message addressed to (or from) one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub handle: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(handle: u32, message: Message) -> Self {
        Self { handle, message }
    }
}

/// Encodes `frame` at the start of `buf` and returns the bytes written.
///
/// Nothing is written when the frame is invalid or `buf` is too small.
pub fn encode(frame: &Frame, buf: &mut [u8]) -> Result<usize> {
    let len = frame.message.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(Error::MessageTooLarge(len));
    }
    if buf.len() < len {
        return Err(Error::BufferTooSmall {
            needed: len,
            available: buf.len(),
        });
    }
    // Validate before touching the output.
    let instruction_bytes = match &frame.message {
        Message::Instruction(instruction) => Some(instruction.encode()?),
        Message::Create(create) => {
            check_wire_string(&create.algorithm)?;
            None
        }
        _ => None,
    };

    let header = MessageHeader {
        kind: frame.message.kind(),
        len: len as u8,
        handle: frame.handle,
    };
    buf[..HEADER_LEN].copy_from_slice(&header.to_bytes());
    let body = &mut buf[HEADER_LEN..len];
    match &frame.message {
        Message::Create(create) => {
            body[0..4].copy_from_slice(&create.start_seq.to_le_bytes());
            write_wire_string(&mut body[4..], &create.algorithm);
        }
        Message::Measure(measure) => {
            body[0..4].copy_from_slice(&measure.ack.to_le_bytes());
            body[4..8].copy_from_slice(&measure.rtt.to_le_bytes());
            body[8..12].copy_from_slice(&measure.loss.to_le_bytes());
            body[12..20].copy_from_slice(&measure.rate_in.to_le_bytes());
            body[20..28].copy_from_slice(&measure.rate_out.to_le_bytes());
        }
        Message::Drop(kind) => write_wire_string(body, kind.as_str()),
        Message::Pattern(events) => {
            body[0..4].copy_from_slice(&(events.len() as u32).to_le_bytes());
            let mut offset = 4;
            for event in events {
                offset += event.write_to(&mut body[offset..]);
            }
        }
        Message::Instruction(_) => {
            if let Some(bytes) = instruction_bytes {
                body.copy_from_slice(&bytes);
            }
        }
    }
    Ok(len)
}

pub fn decode_header(buf: &[u8]) -> Result<MessageHeader> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let kind = MessageKind::from_u8(buf[KIND_OFFSET])?;
    let len = buf[LEN_OFFSET];
    if (len as usize) < HEADER_LEN {
        return Err(Error::Malformed("length shorter than header"));
    }
    if len as usize > buf.len() {
        return Err(Error::Truncated {
            needed: len as usize,
            available: buf.len(),
        });
    }
    let handle = u32::from_le_bytes([
        buf[HANDLE_OFFSET],
        buf[HANDLE_OFFSET + 1],
        buf[HANDLE_OFFSET + 2],
        buf[HANDLE_OFFSET + 3],
    ]);
    Ok(MessageHeader { kind, len, handle })
}

/// Decodes a body whose extent is exactly `body.len()` bytes.
pub fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Message> {
    match kind {
        MessageKind::Create => {
            need(body, 5)?;
            let start_seq = read_u32(body, 0);
            let name = read_wire_string(&body[4..])?;
            let mut algorithm = ArrayString::new();
            algorithm
                .try_push_str(name)
                .map_err(|_| Error::Malformed("algorithm name too long"))?;
            Ok(Message::Create(Create {
                start_seq,
                algorithm,
            }))
        }
        MessageKind::Measure => {
            need(body, MEASURE_BODY_LEN)?;
            exact(body, MEASURE_BODY_LEN)?;
            Ok(Message::Measure(Measure {
                ack: read_u32(body, 0),
                rtt: read_u32(body, 4),
                loss: read_u32(body, 8),
                rate_in: read_u64(body, 12),
                rate_out: read_u64(body, 20),
            }))
        }
        MessageKind::Drop => {
            need(body, 1)?;
            let reason = read_wire_string(body)?;
            DropKind::parse(reason).map(Message::Drop)
        }
        MessageKind::Pattern => {
            need(body, 4)?;
            let count = read_u32(body, 0) as usize;
            if count > MAX_PATTERN_EVENTS {
                return Err(Error::Malformed("too many pattern events"));
            }
            let mut events = Pattern::new();
            let mut offset = 4;
            for _ in 0..count {
                let (event, used) = PatternEvent::read_from(&body[offset..])?;
                events.push(event);
                offset += used;
            }
            exact(body, offset)?;
            Ok(Message::Pattern(events))
        }
        MessageKind::Instruction => {
            need(body, instruction::INSTRUCTION_LEN)?;
            exact(body, instruction::INSTRUCTION_LEN)?;
            Instruction::decode(body).map(Message::Instruction)
        }
    }
}

/// Decodes the frame at the start of `buf`, returning it and its length.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
    let header = decode_header(buf)?;
    let len = header.len as usize;
    let message = decode_body(header.kind, &buf[HEADER_LEN..len])?;
    Ok((Frame::new(header.handle, message), len))
}

/// Iterator over back-to-back frames in a delivery buffer.
///
/// A bad body is reported and skipped using the header's length; a bad header
/// ends iteration because the next frame boundary is unknown.
pub struct Frames<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.offset..];
        let header = match decode_header(rest) {
            Ok(header) => header,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        let len = header.len as usize;
        self.offset += len;
        Some(
            decode_body(header.kind, &rest[HEADER_LEN..len])
                .map(|message| Frame::new(header.handle, message)),
        )
    }
}

fn check_wire_string(value: &str) -> Result<()> {
    if value.len() + 1 > MAX_STRING_LEN {
        return Err(Error::MessageTooLarge(value.len() + 1));
    }
    if value.as_bytes().contains(&0) {
        return Err(Error::Malformed("string contains NUL"));
    }
    Ok(())
}

fn write_wire_string(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()] = 0;
}

/// The terminator must be the last byte of `buf`.
fn read_wire_string(buf: &[u8]) -> Result<&str> {
    if buf.len() > MAX_STRING_LEN {
        return Err(Error::Malformed("string exceeds maximum length"));
    }
    let Some((&last, content)) = buf.split_last() else {
        return Err(Error::Malformed("empty string body"));
    };
    if last != 0 || content.contains(&0) {
        return Err(Error::Malformed("string not NUL-terminated at body end"));
    }
    std::str::from_utf8(content).map_err(|_| Error::Malformed("string is not utf-8"))
}

fn need(body: &[u8], needed: usize) -> Result<()> {
    if body.len() < needed {
        return Err(Error::Truncated {
            needed: HEADER_LEN + needed,
            available: HEADER_LEN + body.len(),
        });
    }
    Ok(())
}

fn exact(body: &[u8], expected: usize) -> Result<()> {
    if body.len() != expected {
        return Err(Error::Malformed("length does not match body"));
    }
    Ok(())
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
