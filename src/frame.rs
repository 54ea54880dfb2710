//! Wire frame: one opcode plus a payload.
//!
//! The raw-TCP transport writes `[1 byte opcode][4 bytes BE length][payload]`.
//! The WebSocket transport maps the same opcodes onto native WebSocket frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Frame header on the binary transport: opcode + u32 length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound for a single binary frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// 帧操作码，取值与 WebSocket 协议保持一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    /// Control opcodes carry meaning even with an empty payload.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(TransportError::protocol_error(
                "frame",
                format!("unknown opcode 0x{:x}", other),
            )),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

/// 一帧数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    pub fn ping() -> Self {
        Self::new(OpCode::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(OpCode::Pong, Bytes::new())
    }

    /// Close frame whose payload is the reason text.
    pub fn close(reason: impl Into<String>) -> Self {
        Self::new(OpCode::Close, Bytes::from(reason.into()))
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encoded size on the binary transport.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// Binary-transport frame codec.
///
/// Decoding is streaming: a partial header or payload leaves the buffer
/// untouched and yields `Ok(None)` until enough bytes arrive.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let opcode = OpCode::try_from(src[0])?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_len {
            return Err(TransportError::protocol_error(
                "frame",
                format!("frame length {} exceeds limit {}", len, self.max_frame_len),
            ));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { opcode, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = frame.payload.len();
        if len > self.max_frame_len || len > u32::MAX as usize {
            return Err(TransportError::protocol_error(
                "frame",
                format!("frame length {} exceeds limit {}", len, self.max_frame_len),
            ));
        }

        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u8(frame.opcode.into());
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
