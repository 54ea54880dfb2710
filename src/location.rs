//! Compact address of a live channel on a gateway instance.

use bytes::{Bytes, BytesMut};

use crate::packet::{read_short_string, write_short_string, PacketError};

/// `{channel_id, gate_id}`，编码为两个 u16 长度前缀的 UTF-8 字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Location {
    pub channel_id: String,
    pub gate_id: String,
}

impl Location {
    pub fn new(channel_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            gate_id: gate_id.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.channel_id.len() + self.gate_id.len()
    }

    pub fn to_bytes(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        write_short_string(&mut buf, "channel_id", &self.channel_id)?;
        write_short_string(&mut buf, "gate_id", &self.gate_id)?;
        Ok(buf.freeze())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }
        let mut buf = data;
        let channel_id = read_short_string(&mut buf, "channel_id")?;
        let gate_id = read_short_string(&mut buf, "gate_id")?;
        Ok(Self {
            channel_id,
            gate_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_bytes() {
        let loc = Location::new("ch1", "gw1");
        let bytes = loc.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0, 3, b'c', b'h', b'1', 0, 3, b'g', b'w', b'1']);
        assert_eq!(bytes.len(), loc.encoded_len());
        assert_eq!(Location::from_bytes(&bytes).unwrap(), loc);
    }

    #[test]
    fn test_empty_input() {
        let err = Location::from_bytes(&[]).unwrap_err();
        assert_eq!(err, PacketError::Empty);
        assert_eq!(err.to_string(), "data is empty");
    }

    #[test]
    fn test_truncated_input() {
        // 声明长度 5，实际只有 2 字节
        let err = Location::from_bytes(&[0, 5, b'a', b'b']).unwrap_err();
        assert!(matches!(err, PacketError::Truncated { field: "channel_id", .. }));

        let bytes = Location::new("ch1", "gw1").to_bytes().unwrap();
        assert!(Location::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_empty_fields_are_valid() {
        let loc = Location::new("", "");
        let bytes = loc.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 0]);
        assert_eq!(Location::from_bytes(&bytes).unwrap(), loc);
    }
}
