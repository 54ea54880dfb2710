use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::{
    error::TransportError,
    frame::{Frame, OpCode},
    pool::{BufferPool, IoBuffers},
};

/// 连接的读半部分
///
/// 同一时刻只允许一个读者。
#[async_trait]
pub trait FrameRead: Send {
    /// 读取一帧，阻塞直到收到完整帧或连接出错
    async fn read_frame(&mut self) -> Result<Frame, TransportError>;

    /// 交还池化的读缓冲区
    fn into_buffer(self: Box<Self>) -> Option<bytes::BytesMut> {
        None
    }
}

/// 连接的写半部分
///
/// 不做内部同步，调用方保证单写者。
#[async_trait]
pub trait FrameWrite: Send {
    /// 写入一帧（可能只进入缓冲区）
    async fn write_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), TransportError>;

    /// 把缓冲区内容刷到 socket
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// 刷新并关闭写方向
    async fn shutdown(&mut self) -> Result<(), TransportError>;

    /// 交还池化的写缓冲区
    fn into_buffer(self: Box<Self>) -> Option<bytes::BytesMut> {
        None
    }
}

/// 连接信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub protocol: &'static str,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// 传输层自行回复 Ping（WebSocket 由 tungstenite 回 Pong）
    pub auto_pong: bool,
}

impl ConnectionInfo {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            local_addr: None,
            peer_addr: None,
            auto_pong: false,
        }
    }

    pub fn with_auto_pong(mut self) -> Self {
        self.auto_pong = true;
        self
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{}://{}", self.protocol, addr),
            None => write!(f, "{}://unknown", self.protocol),
        }
    }
}

/// 一条已完成传输层升级的连接
///
/// 握手阶段由 Acceptor/Dialer 直接读写；握手完成后交给 Channel 拆分为读写两半。
pub struct Connection {
    reader: Box<dyn FrameRead>,
    writer: Box<dyn FrameWrite>,
    info: ConnectionInfo,
}

impl Connection {
    pub fn new(
        reader: Box<dyn FrameRead>,
        writer: Box<dyn FrameWrite>,
        info: ConnectionInfo,
    ) -> Self {
        Self {
            reader,
            writer,
            info,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(
        &mut self,
        opcode: OpCode,
        payload: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        self.writer.write_frame(opcode, payload.into()).await
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.writer.flush().await
    }

    /// 发送一个带原因的 Close 帧，然后关闭写方向
    pub async fn close_with(&mut self, reason: &str) -> Result<(), TransportError> {
        self.writer
            .write_frame(OpCode::Close, Bytes::copy_from_slice(reason.as_bytes()))
            .await?;
        self.writer.shutdown().await
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await
    }

    /// 拆分为独立的读写两半
    pub fn into_parts(self) -> ConnectionParts {
        ConnectionParts {
            reader: self.reader,
            writer: self.writer,
            info: self.info,
        }
    }

    /// 结束使用，交还全部池化缓冲区
    pub fn release(self) -> IoBuffers {
        IoBuffers::reclaim(Some(self.reader), Some(self.writer))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

/// `Connection::into_parts` 的结果
pub struct ConnectionParts {
    pub reader: Box<dyn FrameRead>,
    pub writer: Box<dyn FrameWrite>,
    pub info: ConnectionInfo,
}

/// 传输层升级：WebSocket 走 HTTP Upgrade，原始 TCP 什么也不做
///
/// 需要读写缓冲区的实现在升级成功时才从 `pool` 中取，失败时不占用池。
#[async_trait]
pub trait Upgrader: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upgrade(
        &self,
        stream: TcpStream,
        pool: &BufferPool,
    ) -> Result<Connection, TransportError>;
}

/// 拨号上下文
#[derive(Debug, Clone)]
pub struct DialerContext {
    /// 本端 ID
    pub id: String,
    /// 本端服务名
    pub name: String,
    /// 目标地址
    pub address: String,
    pub timeout: Duration,
}

/// 建立连接并完成应用层握手
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<Connection, TransportError>;
}

/// 为一次操作设置截止时间；`wait` 为 0 时不设超时
pub async fn with_deadline<T, F>(
    operation: &'static str,
    wait: Duration,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if wait.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(wait, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::timeout_error(operation, wait)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let err = with_deadline("read_frame", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref operation, .. } if operation == "read_frame"));
    }

    #[tokio::test]
    async fn test_with_deadline_zero_waits_forever() {
        let value = with_deadline("flush", Duration::ZERO, async { Ok::<_, TransportError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_connection_info_display() {
        let info = ConnectionInfo::new("tcp")
            .with_addrs(None, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(info.to_string(), "tcp://127.0.0.1:9000");
        assert_eq!(ConnectionInfo::new("ws").to_string(), "ws://unknown");
    }
}
