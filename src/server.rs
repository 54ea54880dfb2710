//! 服务端：监听、升级、握手、注册 channel 并驱动读循环
//!
//! 每个连接一个任务。握手得到 channel ID 后，channel 注册到 [`ChannelRegistry`]，
//! 读循环退出时从注册表移除并回调 [`StateListener::disconnect`]，无论哪一端发起关闭。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, MessageListener, Meta},
    config::ServerOptions,
    connection::{with_deadline, Connection, Upgrader},
    discovery::ServiceInstance,
    error::{CloseReason, TransportError},
    pool::{BufferPool, WorkerPool},
    registry::ChannelRegistry,
};

/// accept 出错后的退避
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 握手：从新连接上读出 channel ID 与元数据
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(
        &self,
        conn: &mut Connection,
        timeout: Duration,
    ) -> Result<(String, Meta), TransportError>;
}

/// 不读取任何数据，直接分配一个随机 ID
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAcceptor;

#[async_trait]
impl Acceptor for DefaultAcceptor {
    async fn accept(
        &self,
        _conn: &mut Connection,
        _timeout: Duration,
    ) -> Result<(String, Meta), TransportError> {
        Ok((uuid::Uuid::new_v4().to_string(), Meta::new()))
    }
}

/// 连接断开通知
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn disconnect(&self, id: &str) -> Result<(), TransportError>;
}

/// 服务端构建器
pub struct ServerBuilder {
    listen: String,
    service: ServiceInstance,
    options: ServerOptions,
    upgrader: Option<Arc<dyn Upgrader>>,
    acceptor: Option<Arc<dyn Acceptor>>,
    message_listener: Option<Arc<dyn MessageListener>>,
    state_listener: Option<Arc<dyn StateListener>>,
}

impl ServerBuilder {
    pub fn new(listen: impl Into<String>, service: ServiceInstance) -> Self {
        Self {
            listen: listen.into(),
            service,
            options: ServerOptions::default(),
            upgrader: None,
            acceptor: None,
            message_listener: None,
            state_listener: None,
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// 不设置时按服务协议选择：`ws` 为 WebSocket，其余为原始 TCP
    pub fn upgrader(mut self, upgrader: Arc<dyn Upgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// 不设置时使用 [`DefaultAcceptor`]
    pub fn acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn message_listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.message_listener = Some(listener);
        self
    }

    pub fn state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.state_listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<Arc<Server>, TransportError> {
        self.options.validate()?;
        let message_listener = self
            .message_listener
            .ok_or_else(|| TransportError::config_error("message_listener", "message listener is nil"))?;
        let state_listener = self
            .state_listener
            .ok_or_else(|| TransportError::config_error("state_listener", "state listener is nil"))?;
        let upgrader = match self.upgrader {
            Some(upgrader) => upgrader,
            None => default_upgrader(&self.service.protocol)?,
        };
        let acceptor = self
            .acceptor
            .unwrap_or_else(|| Arc::new(DefaultAcceptor));

        Ok(Arc::new(Server {
            buffers: BufferPool::new(self.options.connection_pool),
            workers: WorkerPool::new(self.options.message_pool),
            connections: Arc::new(Semaphore::new(self.options.connection_pool)),
            listen: self.listen,
            service: self.service,
            options: self.options,
            upgrader,
            acceptor,
            message_listener,
            state_listener,
            channels: Arc::new(ChannelRegistry::new()),
            cancel: CancellationToken::new(),
            quit: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }))
    }
}

fn default_upgrader(protocol: &str) -> Result<Arc<dyn Upgrader>, TransportError> {
    match protocol {
        #[cfg(feature = "websocket")]
        "ws" | "websocket" => Ok(Arc::new(crate::adapters::WebSocketUpgrader)),
        #[cfg(feature = "tcp")]
        "tcp" | "" => Ok(Arc::new(crate::adapters::TcpUpgrader)),
        other => Err(TransportError::config_error(
            "protocol",
            format!("unsupported protocol {}", other),
        )),
    }
}

pub struct Server {
    listen: String,
    service: ServiceInstance,
    options: ServerOptions,
    upgrader: Arc<dyn Upgrader>,
    acceptor: Arc<dyn Acceptor>,
    message_listener: Arc<dyn MessageListener>,
    state_listener: Arc<dyn StateListener>,
    channels: Arc<ChannelRegistry>,
    buffers: BufferPool,
    workers: WorkerPool,
    connections: Arc<Semaphore>,
    cancel: CancellationToken,
    quit: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn builder(listen: impl Into<String>, service: ServiceInstance) -> ServerBuilder {
        ServerBuilder::new(listen, service)
    }

    pub fn service_id(&self) -> &str {
        &self.service.id
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    pub fn service(&self) -> &ServiceInstance {
        &self.service
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// 实际监听地址，监听开始之前为 None
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// 绑定监听地址并运行 accept 循环，直到 `shutdown`
    ///
    /// 绑定失败直接返回错误。
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.listen).await.map_err(|e| {
            TransportError::connection_error(format!("failed to bind {}: {}", self.listen, e), false)
        })?;
        self.serve(listener).await
    }

    /// 在已绑定的 listener 上运行 accept 循环
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(
            listen = %local,
            service = %self.service.id,
            protocol = self.upgrader.name(),
            "server started"
        );

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(peer = %peer, error = %e, "connection finished with error");
                }
            });
        }

        info!(listen = %local, "server stopped accepting");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        let mut conn = self.upgrader.upgrade(stream, &self.buffers).await?;

        let login_wait = self.options.login_wait;
        let handshake = with_deadline("login", login_wait, self.acceptor.accept(&mut conn, login_wait)).await;
        let (id, meta) = match handshake {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(peer = %peer, error = %e, "handshake failed");
                self.reject(conn, &e).await;
                return Err(e);
            }
        };

        if self.channels.contains(&id) {
            let e = TransportError::DuplicateChannel { id };
            warn!(peer = %peer, error = %e, "handshake rejected");
            self.reject(conn, &e).await;
            return Err(e);
        }

        let channel = Channel::new(
            id.clone(),
            meta,
            conn,
            self.workers.clone(),
            self.options.outbound_queue,
        );
        channel.set_read_wait(self.options.read_wait);
        channel.set_write_wait(self.options.write_wait);

        // contains 与 add 之间可能有同 ID 的连接插入
        if let Err(e) = self.channels.add(channel.clone()) {
            warn!(peer = %peer, error = %e, "handshake rejected");
            let _ = channel.close_with(&e.to_string()).await;
            self.buffers.put(channel.release().await);
            return Err(e);
        }
        info!(channel = %id, peer = %peer, "channel accepted");

        let result = channel
            .read_loop(self.message_listener.clone())
            .await;

        self.channels.remove_channel(&channel);
        if let Err(e) = self.state_listener.disconnect(&id).await {
            warn!(channel = %id, error = %e, "disconnect listener failed");
        }
        let _ = channel.close();
        self.buffers.put(channel.release().await);

        match result {
            Ok(()) => Ok(()),
            Err(e) => match CloseReason::from_error(&e) {
                CloseReason::Remote => Ok(()),
                _ => Err(e),
            },
        }
    }

    /// 发送带原因的 Close 帧并归还缓冲区
    async fn reject(&self, mut conn: Connection, error: &TransportError) {
        let reason = error.to_string();
        if let Err(e) = with_deadline("close", self.options.write_wait, conn.close_with(&reason)).await {
            debug!(error = %e, "close frame not delivered");
        }
        self.buffers.put(conn.release());
    }

    /// 推送到本地 channel
    pub async fn push(&self, id: &str, payload: Bytes) -> Result<(), TransportError> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| TransportError::ChannelNotFound { id: id.to_string() })?;
        channel.push(payload).await
    }

    /// 停止 accept 并关闭所有 channel
    ///
    /// 超过 `timeout` 时立即返回超时错误，剩余的 channel 留给连接自身的超时关闭。
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.quit.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(service = %self.service.id, "server shutdown");
        self.cancel.cancel();
        self.workers.close();

        let deadline = Instant::now() + timeout;
        for channel in self.channels.all() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout_error("shutdown", timeout));
            }
            if tokio::time::timeout(remaining, channel.close_with("server shutdown"))
                .await
                .is_err()
            {
                return Err(TransportError::timeout_error("shutdown", timeout));
            }
            self.channels.remove_channel(&channel);
        }
        Ok(())
    }
}
