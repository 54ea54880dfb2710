//! 集成测试公用的握手器、监听器与服务端启动函数

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use ximtrans::{
    Acceptor, Agent, Connection, Dialer, DialerContext, Frame, MessageListener, Meta, OpCode,
    Server, ServerOptions, ServiceInstance, StateListener, TcpDialer, TransportError,
};

/// 第一帧 Binary 负载即 channel ID
pub struct LoginAcceptor;

#[async_trait]
impl Acceptor for LoginAcceptor {
    async fn accept(
        &self,
        conn: &mut Connection,
        _timeout: Duration,
    ) -> Result<(String, Meta), TransportError> {
        let frame = conn.read_frame().await?;
        if frame.opcode != OpCode::Binary {
            return Err(TransportError::handshake_error("expect a binary login frame"));
        }
        let id = String::from_utf8(frame.payload.to_vec())
            .map_err(|_| TransportError::handshake_error("id is not utf-8"))?;
        if id.is_empty() {
            return Err(TransportError::handshake_error("id is empty"));
        }
        let mut meta = Meta::new();
        meta.insert("login".to_string(), "password".to_string());
        Ok((id, meta))
    }
}

/// 原样回写收到的负载
pub struct EchoListener;

#[async_trait]
impl MessageListener for EchoListener {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
        let _ = agent.push(payload).await;
    }
}

/// 把断开的 channel ID 发到队列里
pub struct DisconnectRecorder {
    pub tx: flume::Sender<String>,
}

#[async_trait]
impl StateListener for DisconnectRecorder {
    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        let _ = self.tx.send(id.to_string());
        Ok(())
    }
}

/// TCP 建连后发送本端 ID 作为登录帧
pub struct LoginDialer;

#[async_trait]
impl Dialer for LoginDialer {
    async fn dial_and_handshake(&self, ctx: &DialerContext) -> Result<Connection, TransportError> {
        let mut conn = TcpDialer.dial_and_handshake(ctx).await?;
        conn.write_frame(OpCode::Binary, ctx.id.clone()).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub disconnects: flume::Receiver<String>,
}

pub async fn start_server(
    service: ServiceInstance,
    listener: Arc<dyn MessageListener>,
) -> Result<TestServer, Box<dyn std::error::Error>> {
    start_server_with(service, listener, ServerOptions::default()).await
}

pub async fn start_server_with(
    service: ServiceInstance,
    listener: Arc<dyn MessageListener>,
    options: ServerOptions,
) -> Result<TestServer, Box<dyn std::error::Error>> {
    let (tx, disconnects) = flume::unbounded();
    let server = Server::builder("127.0.0.1:0", service)
        .options(options)
        .acceptor(Arc::new(LoginAcceptor))
        .message_listener(listener)
        .state_listener(Arc::new(DisconnectRecorder { tx }))
        .build()?;

    let tcp = TcpListener::bind("127.0.0.1:0").await?;
    let addr = tcp.local_addr()?;
    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve(tcp).await {
            eprintln!("server stopped: {}", e);
        }
    });
    Ok(TestServer {
        server,
        addr,
        disconnects,
    })
}

/// 拨号并发送登录帧
pub async fn login(addr: SocketAddr, id: &str) -> Result<Connection, TransportError> {
    let ctx = DialerContext {
        id: id.to_string(),
        name: "test".to_string(),
        address: addr.to_string(),
        timeout: Duration::from_secs(2),
    };
    LoginDialer.dial_and_handshake(&ctx).await
}

/// 只建连，不发送登录帧
pub async fn dial(addr: SocketAddr) -> Result<Connection, TransportError> {
    let ctx = DialerContext {
        id: String::new(),
        name: "test".to_string(),
        address: addr.to_string(),
        timeout: Duration::from_secs(2),
    };
    TcpDialer.dial_and_handshake(&ctx).await
}

/// 带超时地读一帧
pub async fn read_frame(conn: &mut Connection) -> Result<Frame, Box<dyn std::error::Error>> {
    Ok(tokio::time::timeout(Duration::from_secs(2), conn.read_frame()).await??)
}

/// 等待某个条件成立，最多 2 秒
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
