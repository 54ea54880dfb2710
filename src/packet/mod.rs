/// 业务数据包定义
///
/// 每个数据包以 4 字节魔数开头，读取方据此区分 LogicPacket 与只携带心跳的 BasicPacket，
/// 然后再解析后续内容。

mod basic;
mod logic;
mod sequence;

pub use basic::{BasicPacket, CODE_PING, CODE_PONG};
pub use logic::{
    Header, LogicPacket, Meta, MetaType, MetaValue, Status, META_DEST_CHANNELS, META_DEST_SERVER,
    META_KEY_ACCOUNT, META_KEY_APP,
};
pub use sequence::{Sequence, SEQUENCE};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 4 字节魔数
pub type Magic = [u8; 4];

/// LogicPacket 魔数
pub const MAGIC_LOGIC_PKT: Magic = [0xc3, 0x11, 0xa3, 0x65];

/// BasicPacket 魔数
pub const MAGIC_BASIC_PKT: Magic = [0xc3, 0x15, 0xa7, 0x65];

/// 按魔数区分的数据包
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Logic(LogicPacket),
    Basic(BasicPacket),
}

impl Packet {
    /// 读取魔数并解码对应的数据包
    pub fn read(buf: &mut impl Buf) -> Result<Self, PacketError> {
        let magic: Magic = read_array(buf)?;
        match magic {
            MAGIC_LOGIC_PKT => Ok(Packet::Logic(LogicPacket::decode(buf)?)),
            MAGIC_BASIC_PKT => Ok(Packet::Basic(BasicPacket::decode(buf)?)),
            other => Err(PacketError::InvalidMagic(other)),
        }
    }

    /// 从完整字节数组解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = bytes;
        Self::read(&mut buf)
    }

    pub fn magic(&self) -> Magic {
        match self {
            Packet::Logic(_) => MAGIC_LOGIC_PKT,
            Packet::Basic(_) => MAGIC_BASIC_PKT,
        }
    }

    /// 写入魔数，随后写入序列化后的数据包
    pub fn marshal(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.magic());
        match self {
            Packet::Logic(p) => p.encode(&mut buf)?,
            Packet::Basic(p) => p.encode(&mut buf)?,
        }
        Ok(buf.freeze())
    }
}

impl From<LogicPacket> for Packet {
    fn from(packet: LogicPacket) -> Self {
        Packet::Logic(packet)
    }
}

impl From<BasicPacket> for Packet {
    fn from(packet: BasicPacket) -> Self {
        Packet::Basic(packet)
    }
}

/// 读取一个数据包，要求必须是 LogicPacket
pub fn read_logic_packet(buf: &mut impl Buf) -> Result<LogicPacket, PacketError> {
    match Packet::read(buf)? {
        Packet::Logic(packet) => Ok(packet),
        Packet::Basic(_) => Err(PacketError::NotLogicPacket),
    }
}

/// 数据包错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("data is empty")]
    Empty,

    #[error("magic code {0:02x?} is incorrect")]
    InvalidMagic(Magic),

    #[error("packet is not a logic packet")]
    NotLogicPacket,

    #[error("truncated {field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),

    #[error("unknown meta type {0}")]
    UnknownMetaType(u8),

    #[error("{field} too long: {len} bytes")]
    TooLong { field: &'static str, len: usize },
}

// 大端序读写辅助函数

fn ensure(buf: &impl Buf, field: &'static str, needed: usize) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        return Err(PacketError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn read_array<const N: usize>(buf: &mut impl Buf) -> Result<[u8; N], PacketError> {
    ensure(buf, "magic", N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn read_u8(buf: &mut impl Buf, field: &'static str) -> Result<u8, PacketError> {
    ensure(buf, field, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut impl Buf, field: &'static str) -> Result<u16, PacketError> {
    ensure(buf, field, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut impl Buf, field: &'static str) -> Result<u32, PacketError> {
    ensure(buf, field, 4)?;
    Ok(buf.get_u32())
}

/// 读取 u32 长度前缀的字节串
pub(crate) fn read_bytes(buf: &mut impl Buf, field: &'static str) -> Result<Bytes, PacketError> {
    let len = read_u32(buf, field)? as usize;
    ensure(buf, field, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// 读取 u16 长度前缀的 UTF-8 字符串
pub(crate) fn read_short_string(
    buf: &mut impl Buf,
    field: &'static str,
) -> Result<String, PacketError> {
    let len = read_u16(buf, field)? as usize;
    ensure(buf, field, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8(field))
}

pub(crate) fn write_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// 写入 u16 长度前缀的字符串，超过 u16 上限时报错
pub(crate) fn write_short_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), PacketError> {
    if value.len() > u16::MAX as usize {
        return Err(PacketError::TooLong {
            field,
            len: value.len(),
        });
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_branches_on_magic() {
        let ping = Packet::Basic(BasicPacket::ping());
        let bytes = ping.marshal().unwrap();
        assert_eq!(&bytes[..4], &MAGIC_BASIC_PKT);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), ping);

        let logic = Packet::Logic(LogicPacket::new("chat.user.talk").with_body("hello"));
        let bytes = logic.marshal().unwrap();
        assert_eq!(&bytes[..4], &MAGIC_LOGIC_PKT);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), logic);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let err = Packet::from_bytes(&[1, 2, 3, 4, 0, 0]).unwrap_err();
        assert_eq!(err, PacketError::InvalidMagic([1, 2, 3, 4]));

        let err = Packet::from_bytes(&[0xc3, 0x11]).unwrap_err();
        assert!(matches!(err, PacketError::Truncated { .. }));
    }

    #[test]
    fn test_read_logic_packet_rejects_basic() {
        let bytes = Packet::Basic(BasicPacket::pong()).marshal().unwrap();
        let mut buf = &bytes[..];
        assert_eq!(
            read_logic_packet(&mut buf).unwrap_err(),
            PacketError::NotLogicPacket
        );
    }

    #[test]
    fn test_truncated_body_is_reported() {
        let packet = Packet::Logic(LogicPacket::new("login.signin").with_body("payload"));
        let bytes = packet.marshal().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Packet::from_bytes(cut),
            Err(PacketError::Truncated { field: "body", .. })
        ));
    }
}
