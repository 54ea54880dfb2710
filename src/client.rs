//! 到依赖服务的出站连接
//!
//! 读写两半分别加锁：`send` 与心跳共享写半部分，`read` 独占读半部分。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    config::ClientOptions,
    connection::{with_deadline, ConnectionInfo, Dialer, DialerContext, FrameRead, FrameWrite},
    discovery::{ServiceClient, ServiceInstance},
    error::TransportError,
    frame::{Frame, OpCode},
};

const STATE_IDLE: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct Client {
    /// 本端 ID，握手时发给对端
    local_id: String,
    local_name: String,
    id: String,
    name: String,
    service: RwLock<ServiceInstance>,
    options: ClientOptions,
    dialer: Arc<dyn Dialer>,
    state: AtomicU8,
    reader: tokio::sync::Mutex<Option<Box<dyn FrameRead>>>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWrite>>>,
    info: Mutex<Option<ConnectionInfo>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(
        local_id: impl Into<String>,
        local_name: impl Into<String>,
        service: ServiceInstance,
        options: ClientOptions,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            local_name: local_name.into(),
            id: service.id.clone(),
            name: service.name.clone(),
            service: RwLock::new(service),
            options,
            dialer,
            state: AtomicU8::new(STATE_IDLE),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            info: Mutex::new(None),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        self.info.lock().clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// 建连并握手，只允许成功一次；失败后可以重试
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<(), TransportError> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::connection_error(
                format!("client {} has connected", self.id),
                false,
            ));
        }

        let ctx = DialerContext {
            id: self.local_id.clone(),
            name: self.local_name.clone(),
            address: address.to_string(),
            timeout: self.options.dial_timeout,
        };
        let conn = match self.dialer.dial_and_handshake(&ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state.store(STATE_IDLE, Ordering::Release);
                return Err(e);
            }
        };

        let parts = conn.into_parts();
        info!(service = %self.id, remote = %parts.info, "client connected");
        *self.info.lock() = Some(parts.info);
        *self.reader.lock().await = Some(parts.reader);
        *self.writer.lock().await = Some(parts.writer);

        if !self.options.heartbeat.is_zero() {
            let task = tokio::spawn(heartbeat_loop(Arc::downgrade(self), self.options.heartbeat));
            *self.heartbeat.lock() = Some(task);
        }
        Ok(())
    }

    fn not_connected(&self) -> TransportError {
        TransportError::connection_error(format!("client {} is not connected", self.id), false)
    }

    async fn write(&self, opcode: OpCode, payload: Bytes) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.not_connected())?;
        let wait = self.options.write_wait;
        with_deadline("write_frame", wait, writer.write_frame(opcode, payload)).await?;
        with_deadline("flush", wait, writer.flush()).await
    }

    /// 读取一帧；启用心跳时带读超时
    pub async fn read(&self) -> Result<Frame, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.not_connected())?;
        let wait = if self.options.heartbeat.is_zero() {
            Duration::ZERO
        } else {
            self.options.read_wait
        };
        let frame = with_deadline("read_frame", wait, reader.read_frame()).await?;
        if frame.opcode == OpCode::Close {
            return Err(TransportError::RemoteClosed {
                id: self.id.clone(),
            });
        }
        Ok(frame)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.write(OpCode::Ping, Bytes::new()).await
    }
}

async fn heartbeat_loop(client: Weak<Client>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let client = match client.upgrade() {
            Some(client) => client,
            None => return,
        };
        if !client.is_connected() {
            return;
        }
        if let Err(e) = client.ping().await {
            warn!(service = %client.id, error = %e, "heartbeat failed");
            return;
        }
        debug!(service = %client.id, "ping sent");
    }
}

#[async_trait]
impl ServiceClient for Client {
    fn service_id(&self) -> &str {
        &self.id
    }

    fn service_name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> ServiceInstance {
        self.service.read().clone()
    }

    fn set_meta(&self, key: &str, value: &str) {
        self.service
            .write()
            .meta
            .insert(key.to_string(), value.to_string());
    }

    /// 写入一个 Binary 帧并立即 flush
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        self.write(OpCode::Binary, payload).await
    }

    /// 发送 Close 帧并关闭写方向；重复调用直接返回
    async fn close(&self) -> Result<(), TransportError> {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_CONNECTED {
            return Ok(());
        }
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let wait = self.options.write_wait;
            let _ = with_deadline("write_frame", wait, writer.write_frame(OpCode::Close, Bytes::new())).await;
            let _ = with_deadline("flush", wait, writer.flush()).await;
            writer.shutdown().await?;
        }
        info!(service = %self.id, "client closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.get_mut().take() {
            task.abort();
        }
    }
}
