use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    connection::{Connection, ConnectionInfo, Dialer, DialerContext, FrameRead, FrameWrite, Upgrader},
    error::TransportError,
    frame::{Frame, FrameCodec, OpCode},
    pool::{BufferPool, IoBuffers},
};

/// 每次读 socket 前至少保证的空闲空间
const MIN_READ_SPACE: usize = 1024;
/// 写缓冲超过此大小时在 write_frame 内部先刷一次
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// 基于字节流的帧读取器
///
/// 流式读取：缓冲区里可能有半帧，等到下一次读满再解析。
pub struct StreamFrameReader<R> {
    io: R,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl<R> StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(io: R, buffer: BytesMut) -> Self {
        Self::with_codec(io, FrameCodec::new(), buffer)
    }

    pub fn with_codec(io: R, codec: FrameCodec, buffer: BytesMut) -> Self {
        Self { io, codec, buffer }
    }

    /// 缓冲区中尚未解析的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[async_trait]
impl<R> FrameRead for StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            if self.buffer.capacity() - self.buffer.len() < MIN_READ_SPACE {
                self.buffer.reserve(MIN_READ_SPACE);
            }
            let n = self.io.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(if self.buffer.is_empty() {
                    TransportError::connection_error("connection closed by peer", false)
                } else {
                    TransportError::protocol_error(
                        "frame",
                        format!("connection closed with {} bytes of a partial frame", self.buffer.len()),
                    )
                });
            }
        }
    }

    fn into_buffer(self: Box<Self>) -> Option<BytesMut> {
        Some(self.buffer)
    }
}

/// 基于字节流的帧写入器：写入缓冲区，`flush` 时一次写出
pub struct StreamFrameWriter<W> {
    io: W,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl<W> StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(io: W, buffer: BytesMut) -> Self {
        Self::with_codec(io, FrameCodec::new(), buffer)
    }

    pub fn with_codec(io: W, codec: FrameCodec, buffer: BytesMut) -> Self {
        Self { io, codec, buffer }
    }

    /// 缓冲区中尚未写出的字节数
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    async fn write_buffered(&mut self) -> Result<(), TransportError> {
        if !self.buffer.is_empty() {
            self.io.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl<W> FrameWrite for StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), TransportError> {
        self.codec.encode(Frame::new(opcode, payload), &mut self.buffer)?;
        if self.buffer.len() >= WRITE_HIGH_WATER {
            self.write_buffered().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.write_buffered().await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.write_buffered().await?;
        self.io.shutdown().await?;
        Ok(())
    }

    fn into_buffer(self: Box<Self>) -> Option<BytesMut> {
        Some(self.buffer)
    }
}

pub type TcpFrameReader = StreamFrameReader<OwnedReadHalf>;
pub type TcpFrameWriter = StreamFrameWriter<OwnedWriteHalf>;

/// 在 TcpStream 上建立帧连接，缓冲区取自 `buffers`
pub fn tcp_connection(stream: TcpStream, mut buffers: IoBuffers) -> Connection {
    let info = ConnectionInfo::new("tcp").with_addrs(stream.local_addr().ok(), stream.peer_addr().ok());
    let (read_half, write_half) = stream.into_split();
    let reader = TcpFrameReader::new(read_half, buffers.take_read());
    let writer = TcpFrameWriter::new(write_half, buffers.take_write());
    Connection::new(Box::new(reader), Box::new(writer), info)
}

/// 原始 TCP 不需要升级
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpUpgrader;

#[async_trait]
impl Upgrader for TcpUpgrader {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn upgrade(&self, stream: TcpStream, pool: &BufferPool) -> Result<Connection, TransportError> {
        stream.set_nodelay(true)?;
        Ok(tcp_connection(stream, pool.get()))
    }
}

/// TCP 拨号器：只建连，不做应用层握手
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<Connection, TransportError> {
        let stream = crate::connection::with_deadline("dial", ctx.timeout, async {
            TcpStream::connect(&ctx.address).await.map_err(TransportError::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        tracing::debug!(address = %ctx.address, id = %ctx.id, "tcp dialed");
        Ok(tcp_connection(stream, IoBuffers::empty()))
    }
}
