use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_bytes, read_short_string, read_u16, read_u32, read_u8, write_bytes, write_short_string,
    PacketError, SEQUENCE,
};

/// 目标服务 ID
pub const META_DEST_SERVER: &str = "dest.server";
/// 目标 channel 列表，逗号分隔
pub const META_DEST_CHANNELS: &str = "dest.channels";
pub const META_KEY_APP: &str = "app";
pub const META_KEY_ACCOUNT: &str = "account";

/// 状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Success,
    NoDestination,
    InvalidPacketBody,
    InvalidCommand,
    Unauthenticated,
    SystemException,
    NotImplemented,
    SessionNotFound,
    /// 本端不认识的状态码，原样保留
    Other(u16),
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0,
            Status::NoDestination => 100,
            Status::InvalidPacketBody => 101,
            Status::InvalidCommand => 103,
            Status::Unauthenticated => 105,
            Status::SystemException => 300,
            Status::NotImplemented => 301,
            Status::SessionNotFound => 404,
            Status::Other(code) => code,
        }
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            0 => Status::Success,
            100 => Status::NoDestination,
            101 => Status::InvalidPacketBody,
            103 => Status::InvalidCommand,
            105 => Status::Unauthenticated,
            300 => Status::SystemException,
            301 => Status::NotImplemented,
            404 => Status::SessionNotFound,
            other => Status::Other(other),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

/// meta 值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MetaType {
    Int = 0,
    #[default]
    String = 1,
    Float = 2,
}

impl TryFrom<u8> for MetaType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MetaType::Int),
            1 => Ok(MetaType::String),
            2 => Ok(MetaType::Float),
            other => Err(PacketError::UnknownMetaType(other)),
        }
    }
}

/// 一条 meta 扩展；值统一以字符串存储，读取时按类型解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub key: String,
    pub value: String,
    pub kind: MetaType,
}

impl Meta {
    pub fn new(key: impl Into<String>, value: impl Into<String>, kind: MetaType) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind,
        }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, value, MetaType::String)
    }

    pub fn int(key: impl Into<String>, value: i64) -> Self {
        Self::new(key, value.to_string(), MetaType::Int)
    }

    pub fn float(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, value.to_string(), MetaType::Float)
    }

    /// 按类型解析；数值解析失败时取 0
    pub fn typed_value(&self) -> MetaValue {
        match self.kind {
            MetaType::Int => MetaValue::Int(self.value.parse().unwrap_or_default()),
            MetaType::Float => MetaValue::Float(self.value.parse().unwrap_or_default()),
            MetaType::String => MetaValue::Str(self.value.clone()),
        }
    }
}

/// 解析后的 meta 值
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetaValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// 消息头
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub command: String,
    pub sequence: u32,
    pub channel_id: String,
    pub status: Status,
    pub dest: String,
    pub meta: Vec<Meta>,
}

impl Header {
    /// command 中第一个 `.` 之前的部分；没有 `.` 时为 "default"
    pub fn service_name(&self) -> &str {
        match self.command.split_once('.') {
            Some((service, _)) => service,
            None => "default",
        }
    }

    /// 线性查找，重复 key 时返回第一个
    pub fn find_meta(&self, key: &str) -> Option<&Meta> {
        self.meta.iter().find(|m| m.key == key)
    }

    pub fn get_meta(&self, key: &str) -> Option<MetaValue> {
        self.find_meta(key).map(Meta::typed_value)
    }

    /// 字符串形式的原始值，不做类型解析
    pub fn get_meta_str(&self, key: &str) -> Option<&str> {
        self.find_meta(key).map(|m| m.value.as_str())
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        write_short_string(buf, "command", &self.command)?;
        buf.put_u32(self.sequence);
        write_short_string(buf, "channel_id", &self.channel_id)?;
        buf.put_u16(self.status.into());
        write_short_string(buf, "dest", &self.dest)?;
        if self.meta.len() > u16::MAX as usize {
            return Err(PacketError::TooLong {
                field: "meta",
                len: self.meta.len(),
            });
        }
        buf.put_u16(self.meta.len() as u16);
        for meta in &self.meta {
            write_short_string(buf, "meta.key", &meta.key)?;
            buf.put_u8(meta.kind as u8);
            write_short_string(buf, "meta.value", &meta.value)?;
        }
        Ok(())
    }

    pub fn decode(buf: &mut impl bytes::Buf) -> Result<Self, PacketError> {
        let command = read_short_string(buf, "command")?;
        let sequence = read_u32(buf, "sequence")?;
        let channel_id = read_short_string(buf, "channel_id")?;
        let status = Status::from(read_u16(buf, "status")?);
        let dest = read_short_string(buf, "dest")?;
        let count = read_u16(buf, "meta")? as usize;
        let mut meta = Vec::with_capacity(count);
        for _ in 0..count {
            let key = read_short_string(buf, "meta.key")?;
            let kind = MetaType::try_from(read_u8(buf, "meta.type")?)?;
            let value = read_short_string(buf, "meta.value")?;
            meta.push(Meta { key, value, kind });
        }
        Ok(Self {
            command,
            sequence,
            channel_id,
            status,
            dest,
            meta,
        })
    }
}

/// 网关对外的业务消息：header + 不透明的 body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogicPacket {
    pub header: Header,
    pub body: Bytes,
}

impl LogicPacket {
    /// 创建一个空 body 的消息，序列号取自进程级计数器
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            header: Header {
                command: command.into(),
                sequence: SEQUENCE.next(),
                ..Header::default()
            },
            body: Bytes::new(),
        }
    }

    /// 复制 header 中的路由字段，meta 不复制
    pub fn from_header(header: &Header) -> Self {
        Self {
            header: Header {
                command: header.command.clone(),
                sequence: header.sequence,
                channel_id: header.channel_id.clone(),
                status: header.status,
                dest: header.dest.clone(),
                meta: Vec::new(),
            },
            body: Bytes::new(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.header.status = status;
        self
    }

    /// 指定序列号，0 表示保留自动分配的值
    pub fn with_seq(mut self, sequence: u32) -> Self {
        if sequence != 0 {
            self.header.sequence = sequence;
        }
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.header.channel_id = channel_id.into();
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.header.dest = dest.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.header.command
    }

    pub fn channel_id(&self) -> &str {
        &self.header.channel_id
    }

    pub fn service_name(&self) -> &str {
        self.header.service_name()
    }

    pub fn add_meta(&mut self, meta: Meta) {
        self.header.meta.push(meta);
    }

    pub fn add_string_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.add_meta(Meta::string(key, value));
    }

    pub fn get_meta(&self, key: &str) -> Option<MetaValue> {
        self.header.get_meta(key)
    }

    /// 删除该 key 的所有条目
    pub fn del_meta(&mut self, key: &str) {
        self.header.meta.retain(|m| m.key != key);
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// `[u32 长度][header][u32 长度][body]`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        let mut header = BytesMut::new();
        self.header.encode(&mut header)?;
        buf.reserve(8 + header.len() + self.body.len());
        write_bytes(buf, &header);
        write_bytes(buf, &self.body);
        Ok(())
    }

    pub fn decode(buf: &mut impl bytes::Buf) -> Result<Self, PacketError> {
        let mut header_bytes = read_bytes(buf, "header")?;
        let header = Header::decode(&mut header_bytes)?;
        let body = read_bytes(buf, "body")?;
        Ok(Self { header, body })
    }
}

impl fmt::Display for LogicPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command:{} seq:{} channel:{} status:{:?} body:{}bytes",
            self.header.command,
            self.header.sequence,
            self.header.channel_id,
            self.header.status,
            self.body.len()
        )
    }
}
