use bytes::{BufMut, Bytes, BytesMut};

use super::{read_u16, PacketError};

pub const CODE_PING: u16 = 1;
pub const CODE_PONG: u16 = 2;

/// 心跳包：`[2 字节 code][2 字节长度][body]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicPacket {
    pub code: u16,
    pub body: Bytes,
}

impl BasicPacket {
    pub fn new(code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(CODE_PING, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::new(CODE_PONG, Bytes::new())
    }

    pub fn is_ping(&self) -> bool {
        self.code == CODE_PING
    }

    pub fn length(&self) -> usize {
        self.body.len()
    }

    /// body 长度字段只有 2 字节，超长直接报错
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        if self.body.len() > u16::MAX as usize {
            return Err(PacketError::TooLong {
                field: "body",
                len: self.body.len(),
            });
        }
        buf.put_u16(self.code);
        buf.put_u16(self.body.len() as u16);
        buf.put_slice(&self.body);
        Ok(())
    }

    pub fn decode(buf: &mut impl bytes::Buf) -> Result<Self, PacketError> {
        let code = read_u16(buf, "code")?;
        let length = read_u16(buf, "length")? as usize;
        if buf.remaining() < length {
            return Err(PacketError::Truncated {
                field: "body",
                needed: length,
                remaining: buf.remaining(),
            });
        }
        let body = buf.copy_to_bytes(length);
        Ok(Self { code, body })
    }

    pub fn to_bytes(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(4 + self.body.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}
