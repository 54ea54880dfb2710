use std::borrow::Cow;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    connection::{Connection, ConnectionInfo, Dialer, DialerContext, FrameRead, FrameWrite, Upgrader},
    error::TransportError,
    frame::{Frame, OpCode},
    pool::BufferPool,
};

/// Close 帧 reason 的协议上限
const MAX_CLOSE_REASON: usize = 123;

/// WebSocket 帧读取器，掩码由 tungstenite 在读取时去除
pub struct WebSocketFrameReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WebSocketFrameReader<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> FrameRead for WebSocketFrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => {
                    return Err(TransportError::connection_error(
                        "WebSocket connection closed",
                        false,
                    ))
                }
            };
            if let Some(frame) = message_to_frame(message) {
                return Ok(frame);
            }
        }
    }
}

fn message_to_frame(message: Message) -> Option<Frame> {
    let frame = match message {
        Message::Binary(data) => Frame::new(OpCode::Binary, data),
        Message::Text(text) => Frame::new(OpCode::Text, text.into_bytes()),
        Message::Ping(data) => Frame::new(OpCode::Ping, data),
        Message::Pong(data) => Frame::new(OpCode::Pong, data),
        Message::Close(close) => {
            let reason = close.map(|c| c.reason.into_owned()).unwrap_or_default();
            Frame::close(reason)
        }
        // 原始帧只在写入端出现
        Message::Frame(_) => return None,
    };
    Some(frame)
}

fn frame_to_message(opcode: OpCode, payload: Bytes) -> Result<Message, TransportError> {
    let message = match opcode {
        OpCode::Binary => Message::Binary(payload.to_vec()),
        OpCode::Text => Message::Text(
            String::from_utf8(payload.to_vec())
                .map_err(|_| TransportError::protocol_error("websocket", "text frame is not utf-8"))?,
        ),
        OpCode::Ping => Message::Ping(payload.to_vec()),
        OpCode::Pong => Message::Pong(payload.to_vec()),
        OpCode::Close => {
            let reason = String::from_utf8_lossy(&payload);
            Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Owned(truncate_reason(&reason).to_string()),
            }))
        }
        OpCode::Continuation => {
            return Err(TransportError::protocol_error(
                "websocket",
                "fragmented frames are not supported",
            ))
        }
    };
    Ok(message)
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// WebSocket 帧写入器；`write_frame` 只入 sink 缓冲，`flush` 时写出
pub struct WebSocketFrameWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WebSocketFrameWriter<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> FrameWrite for WebSocketFrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), TransportError> {
        let message = frame_to_message(opcode, payload)?;
        self.sink.feed(message).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.sink.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 在已完成握手的 WebSocket 流上建立帧连接
///
/// tungstenite 在读取时自动回复 Ping，连接标记为 `auto_pong`。
pub fn websocket_connection<S>(ws: WebSocketStream<S>, info: ConnectionInfo) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Connection::new(
        Box::new(WebSocketFrameReader::new(stream)),
        Box::new(WebSocketFrameWriter::new(sink)),
        info.with_auto_pong(),
    )
}

/// HTTP Upgrade 到 WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketUpgrader;

#[async_trait]
impl Upgrader for WebSocketUpgrader {
    fn name(&self) -> &'static str {
        "websocket"
    }

    // tungstenite 自带读写缓冲，不从池中取
    async fn upgrade(&self, stream: TcpStream, _pool: &BufferPool) -> Result<Connection, TransportError> {
        stream.set_nodelay(true)?;
        let info = ConnectionInfo::new("ws").with_addrs(stream.local_addr().ok(), stream.peer_addr().ok());
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::handshake_error(format!("websocket upgrade failed: {}", e)))?;
        Ok(websocket_connection(ws, info))
    }
}

/// WebSocket 拨号器：`address` 可以是 `ws://host:port/path` 或 `host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<Connection, TransportError> {
        let address = if ctx.address.contains("://") {
            ctx.address.clone()
        } else {
            format!("ws://{}", ctx.address)
        };
        let url = url::Url::parse(&address)
            .map_err(|e| TransportError::config_error("address", format!("{}: {}", address, e)))?;

        let (ws, _response) = crate::connection::with_deadline("dial", ctx.timeout, async {
            tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(TransportError::from)
        })
        .await?;

        let mut info = ConnectionInfo::new("ws");
        if let MaybeTlsStream::Plain(tcp) = ws.get_ref() {
            info = info.with_addrs(tcp.local_addr().ok(), tcp.peer_addr().ok());
        }
        tracing::debug!(address = %url, id = %ctx.id, "websocket dialed");
        Ok(websocket_connection(ws, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_mapping() {
        assert_eq!(
            message_to_frame(Message::Binary(b"abc".to_vec())),
            Some(Frame::binary("abc"))
        );
        assert_eq!(
            message_to_frame(Message::Ping(Vec::new())),
            Some(Frame::ping())
        );
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("bye"),
        }));
        assert_eq!(message_to_frame(close), Some(Frame::close("bye")));
        assert_eq!(message_to_frame(Message::Close(None)), Some(Frame::close("")));
    }

    #[test]
    fn test_continuation_is_rejected() {
        assert!(frame_to_message(OpCode::Continuation, Bytes::new()).is_err());
        assert!(frame_to_message(OpCode::Text, Bytes::from_static(&[0xff])).is_err());
    }

    #[test]
    fn test_close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(cut));

        match frame_to_message(OpCode::Close, Bytes::from(long)).unwrap() {
            Message::Close(Some(frame)) => assert!(frame.reason.len() <= MAX_CLOSE_REASON),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upgrade_does_not_take_pooled_buffers() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"not an http request\r\n\r\n").await.unwrap();
            stream
        });
        let (stream, _) = listener.accept().await.unwrap();
        let pool = BufferPool::new(4);

        let err = WebSocketUpgrader.upgrade(stream, &pool).await.unwrap_err();
        assert_eq!(err.error_code(), "HANDSHAKE_ERROR");
        assert_eq!(pool.stats().get_operations, 0);
        drop(client.await.unwrap());
    }
}
