//! Channel: one upgraded connection with its own read loop and write loop.
//!
//! The read side is driven by whoever calls [`Channel::read_loop`]; the write
//! side is a task spawned at construction that drains a bounded outbound queue
//! and flushes once per batch. The two halves only meet through that queue.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{DEFAULT_READ_WAIT, DEFAULT_WRITE_WAIT},
    connection::{with_deadline, Connection, ConnectionInfo, FrameRead, FrameWrite},
    error::{CloseReason, TransportError},
    frame::{Frame, OpCode},
    pool::{IoBuffers, WorkerPool},
};

/// 握手阶段得到的元数据
pub type Meta = HashMap<String, String>;

const STATE_IDLE: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Channel 生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 已创建，ReadLoop 尚未启动
    Idle,
    /// ReadLoop 运行中
    Active,
    /// Close 已调用，写循环正在退出
    Closing,
    /// 写循环已退出
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_IDLE => ChannelState::Idle,
            STATE_ACTIVE => ChannelState::Active,
            STATE_CLOSING => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// 消息的发送方，可以向它回推消息
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn push(&self, payload: Bytes) -> Result<(), TransportError>;
}

/// 上层消息处理器，运行在分发任务池中
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes);
}

/// 写循环退出时交还的写半部分
struct WriteLoopExit {
    writer: Box<dyn FrameWrite>,
}

pub struct Channel {
    id: String,
    meta: Meta,
    info: ConnectionInfo,
    state: Arc<AtomicU8>,
    outbound: Mutex<Option<flume::Sender<Frame>>>,
    reader: Mutex<Option<Box<dyn FrameRead>>>,
    write_task: Mutex<Option<JoinHandle<WriteLoopExit>>>,
    read_wait_ms: AtomicU64,
    write_wait_ms: Arc<AtomicU64>,
    workers: WorkerPool,
}

impl Channel {
    /// 接管连接并启动写循环
    pub fn new(
        id: impl Into<String>,
        meta: Meta,
        conn: Connection,
        workers: WorkerPool,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let id = id.into();
        let parts = conn.into_parts();
        let (tx, rx) = flume::bounded(queue_capacity.max(1));
        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let write_wait_ms = Arc::new(AtomicU64::new(DEFAULT_WRITE_WAIT.as_millis() as u64));

        let write_task = tokio::spawn(write_loop(
            id.clone(),
            rx,
            parts.writer,
            write_wait_ms.clone(),
            state.clone(),
        ));

        Arc::new(Self {
            id,
            meta,
            info: parts.info,
            state,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(parts.reader)),
            write_task: Mutex::new(Some(write_task)),
            read_wait_ms: AtomicU64::new(DEFAULT_READ_WAIT.as_millis() as u64),
            write_wait_ms,
            workers,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 读超时；0 被忽略
    pub fn set_read_wait(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        self.read_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
    }

    /// 写超时；0 被忽略
    pub fn set_write_wait(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        self.write_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms.load(Ordering::Relaxed))
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms.load(Ordering::Relaxed))
    }

    /// 异步发送：只入队，队列满时等待
    pub async fn push(&self, payload: Bytes) -> Result<(), TransportError> {
        self.enqueue(Frame::binary(payload)).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        if !matches!(self.state(), ChannelState::Idle | ChannelState::Active) {
            return Err(self.closed_error());
        }
        let tx = self.outbound.lock().clone().ok_or_else(|| self.closed_error())?;
        tx.send_async(frame).await.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ChannelClosed {
            id: self.id.clone(),
        }
    }

    /// 关闭出站队列，写循环写完已入队的帧后退出
    ///
    /// 只有第一次调用成功，之后返回 `AlreadyClosed`。
    pub fn close(&self) -> Result<(), TransportError> {
        let from_active = self
            .state
            .compare_exchange(STATE_ACTIVE, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        let closed = from_active
            || self
                .state
                .compare_exchange(STATE_IDLE, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if !closed {
            return Err(TransportError::AlreadyClosed {
                id: self.id.clone(),
            });
        }
        self.outbound.lock().take();
        debug!(channel = %self.id, "channel closing");
        Ok(())
    }

    /// 先入队一个带原因的 Close 帧，再关闭
    pub async fn close_with(&self, reason: &str) -> Result<(), TransportError> {
        let _ = self.enqueue(Frame::close(reason)).await;
        self.close()
    }

    /// 读循环，直到连接出错、超时或对端发来 Close
    ///
    /// 只能进入一次。收到的 Binary 负载交给分发池执行，不阻塞读取。
    pub async fn read_loop(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), TransportError> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::AlreadyStarted {
                id: self.id.clone(),
            });
        }
        let mut reader = match self.reader.lock().take() {
            Some(reader) => reader,
            None => {
                return Err(TransportError::AlreadyStarted {
                    id: self.id.clone(),
                })
            }
        };

        let result = self.serve(reader.as_mut(), listener).await;
        *self.reader.lock() = Some(reader);

        if let Err(ref e) = result {
            info!(channel = %self.id, reason = ?CloseReason::from_error(e), "read loop exited");
        }
        result
    }

    async fn serve(
        self: &Arc<Self>,
        reader: &mut dyn FrameRead,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), TransportError> {
        loop {
            let frame = with_deadline("read_frame", self.read_wait(), reader.read_frame())
                .await
                .map_err(|e| e.with_channel(&self.id))?;
            trace!(channel = %self.id, opcode = ?frame.opcode, len = frame.payload.len(), "frame received");

            match frame.opcode {
                OpCode::Close => {
                    return Err(TransportError::RemoteClosed {
                        id: self.id.clone(),
                    })
                }
                OpCode::Ping => {
                    if self.info.auto_pong {
                        continue;
                    }
                    // 回复走出站队列，保持单写者
                    if let Err(e) = self.enqueue(Frame::pong()).await {
                        debug!(channel = %self.id, error = %e, "pong dropped");
                    }
                    continue;
                }
                OpCode::Binary => {}
                _ => continue,
            }

            let payload = frame.into_payload();
            if payload.is_empty() {
                continue;
            }

            let agent: Arc<dyn Agent> = self.clone();
            let listener = listener.clone();
            self.workers
                .submit(async move {
                    listener.receive(agent, payload).await;
                })
                .await?;
        }
    }

    /// 等写循环退出后收回缓冲区；应在 `close` 之后调用
    pub async fn release(&self) -> IoBuffers {
        let handle = self.write_task.lock().take();
        let writer = match handle {
            Some(handle) => match handle.await {
                Ok(exit) => Some(exit.writer),
                Err(e) => {
                    warn!(channel = %self.id, error = %e, "write loop task failed");
                    None
                }
            },
            None => None,
        };
        let reader = self.reader.lock().take();
        IoBuffers::reclaim(reader, writer)
    }
}

#[async_trait]
impl Agent for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, payload: Bytes) -> Result<(), TransportError> {
        Channel::push(self, payload).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("state", &self.state())
            .finish()
    }
}

/// 写循环：阻塞等待第一帧，随后把队列里已有的帧一并写入，最后只 flush 一次
async fn write_loop(
    id: String,
    rx: flume::Receiver<Frame>,
    mut writer: Box<dyn FrameWrite>,
    write_wait_ms: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
) -> WriteLoopExit {
    let result = async {
        while let Ok(frame) = rx.recv_async().await {
            let wait = Duration::from_millis(write_wait_ms.load(Ordering::Relaxed));
            let mut batch = 1usize;
            with_deadline("write_frame", wait, writer.write_frame(frame.opcode, frame.payload))
                .await?;
            for frame in rx.drain() {
                with_deadline("write_frame", wait, writer.write_frame(frame.opcode, frame.payload))
                    .await?;
                batch += 1;
            }
            with_deadline("flush", wait, writer.flush()).await?;
            trace!(channel = %id, batch, "batch flushed");
        }
        Ok::<(), TransportError>(())
    }
    .await;

    state.store(STATE_CLOSED, Ordering::Release);
    match result {
        Ok(()) => debug!(channel = %id, "write loop exited"),
        Err(ref e) => warn!(channel = %id, error = %e, "write loop failed"),
    }
    if let Err(e) = writer.shutdown().await {
        trace!(channel = %id, error = %e, "shutdown after write loop");
    }
    WriteLoopExit { writer }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use std::sync::atomic::AtomicUsize;

    /// 记录所有写入与 flush 的写半部分
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub events: Mutex<Vec<Event>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Write(OpCode, Bytes),
        Flush,
        Shutdown,
    }

    pub(crate) struct RecordingWriter {
        pub recorder: Arc<Recorder>,
        pub gate: Option<Arc<tokio::sync::Semaphore>>,
    }

    #[async_trait]
    impl FrameWrite for RecordingWriter {
        async fn write_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), TransportError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.map(|p| p.forget()).ok();
            }
            self.recorder.events.lock().push(Event::Write(opcode, payload));
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), TransportError> {
            self.recorder.events.lock().push(Event::Flush);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            self.recorder.events.lock().push(Event::Shutdown);
            Ok(())
        }
    }

    /// 从 flume 队列取帧的读半部分
    pub(crate) struct QueueReader {
        pub rx: flume::Receiver<Frame>,
    }

    #[async_trait]
    impl FrameRead for QueueReader {
        async fn read_frame(&mut self) -> Result<Frame, TransportError> {
            self.rx
                .recv_async()
                .await
                .map_err(|_| TransportError::connection_error("connection closed by peer", false))
        }
    }

    pub(crate) fn test_connection(
        gate: Option<Arc<tokio::sync::Semaphore>>,
    ) -> (Connection, flume::Sender<Frame>, Arc<Recorder>) {
        let (tx, rx) = flume::unbounded();
        let recorder = Arc::new(Recorder::default());
        let conn = Connection::new(
            Box::new(QueueReader { rx }),
            Box::new(RecordingWriter {
                recorder: recorder.clone(),
                gate,
            }),
            ConnectionInfo::new("test"),
        );
        (conn, tx, recorder)
    }

    struct CountingListener {
        received: flume::Sender<(String, Bytes)>,
    }

    #[async_trait]
    impl MessageListener for CountingListener {
        async fn receive(&self, agent: Arc<dyn Agent>, payload: Bytes) {
            let _ = self.received.send((agent.id().to_string(), payload));
        }
    }

    fn writes(recorder: &Recorder) -> Vec<Bytes> {
        recorder
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Write(OpCode::Binary, p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for(recorder: &Recorder, pred: impl Fn(&[Event]) -> bool) {
        for _ in 0..200 {
            if pred(&recorder.events.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", recorder.events.lock());
    }

    #[tokio::test]
    async fn test_push_is_fifo() {
        let (conn, _peer, recorder) = test_connection(None);
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);

        for i in 0..20u8 {
            channel.push(Bytes::from(vec![i])).await.unwrap();
        }
        wait_for(&recorder, |events| {
            events.iter().filter(|e| matches!(e, Event::Write(..))).count() == 20
        })
        .await;

        let got = writes(&recorder);
        let expected: Vec<Bytes> = (0..20u8).map(|i| Bytes::from(vec![i])).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_burst_is_flushed_once() {
        // 写第一帧时阻塞，让 B、C 在队列里堆积
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (conn, _peer, recorder) = test_connection(Some(gate.clone()));
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);

        channel.push(Bytes::from_static(b"A")).await.unwrap();
        channel.push(Bytes::from_static(b"B")).await.unwrap();
        channel.push(Bytes::from_static(b"C")).await.unwrap();
        gate.add_permits(3);

        wait_for(&recorder, |events| events.contains(&Event::Flush)).await;
        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                Event::Write(OpCode::Binary, Bytes::from_static(b"A")),
                Event::Write(OpCode::Binary, Bytes::from_static(b"B")),
                Event::Write(OpCode::Binary, Bytes::from_static(b"C")),
                Event::Flush,
            ]
        );
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (conn, _peer, recorder) = test_connection(None);
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);

        channel.push(Bytes::from_static(b"before")).await.unwrap();
        assert!(channel.close().is_ok());
        let err = channel.close().unwrap_err();
        assert!(matches!(err, TransportError::AlreadyClosed { .. }));

        let err = channel.push(Bytes::from_static(b"after")).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed { .. }));

        channel.release().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        let events = recorder.events.lock().clone();
        assert_eq!(events.first(), Some(&Event::Write(OpCode::Binary, Bytes::from_static(b"before"))));
        assert_eq!(events.last(), Some(&Event::Shutdown));
    }

    #[tokio::test]
    async fn test_concurrent_close_succeeds_once() {
        let (conn, _peer, _recorder) = test_connection(None);
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);

        let ok = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            let ok = ok.clone();
            handles.push(tokio::spawn(async move {
                if channel.close().is_ok() {
                    ok.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_loop_dispatch_ping_and_close() {
        let (conn, peer, recorder) = test_connection(None);
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);
        let (tx, rx) = flume::unbounded();
        let listener = Arc::new(CountingListener { received: tx });

        peer.send(Frame::binary("hello")).unwrap();
        peer.send(Frame::binary(Bytes::new())).unwrap();
        peer.send(Frame::ping()).unwrap();
        peer.send(Frame::new(OpCode::Text, "ignored")).unwrap();
        peer.send(Frame::close("bye")).unwrap();

        let err = channel.read_loop(listener.clone()).await.unwrap_err();
        assert!(matches!(err, TransportError::RemoteClosed { .. }));

        let (id, payload) = rx.recv_async().await.unwrap();
        assert_eq!(id, "c1");
        assert_eq!(payload, Bytes::from_static(b"hello"));
        assert!(rx.try_recv().is_err());

        wait_for(&recorder, |events| {
            events.contains(&Event::Write(OpCode::Pong, Bytes::new()))
        })
        .await;

        let again = channel.read_loop(listener).await.unwrap_err();
        assert!(matches!(again, TransportError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_ping_left_to_auto_pong_transport() {
        let (tx, rx) = flume::unbounded();
        let recorder = Arc::new(Recorder::default());
        let conn = Connection::new(
            Box::new(QueueReader { rx }),
            Box::new(RecordingWriter {
                recorder: recorder.clone(),
                gate: None,
            }),
            ConnectionInfo::new("ws").with_auto_pong(),
        );
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);
        let (received, _rx) = flume::unbounded();

        tx.send(Frame::ping()).unwrap();
        tx.send(Frame::close("bye")).unwrap();
        let err = channel
            .read_loop(Arc::new(CountingListener { received }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RemoteClosed { .. }));

        channel.close().unwrap();
        channel.release().await;
        let events = recorder.events.lock().clone();
        assert!(!events.iter().any(|e| matches!(e, Event::Write(OpCode::Pong, _))));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (conn, _peer, _recorder) = test_connection(None);
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 5);
        channel.set_read_wait(Duration::from_millis(20));
        channel.set_read_wait(Duration::ZERO);
        assert_eq!(channel.read_wait(), Duration::from_millis(20));

        let (tx, _rx) = flume::unbounded();
        let err = channel
            .read_loop(Arc::new(CountingListener { received: tx }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(CloseReason::from_error(&err), CloseReason::Timeout);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_push() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (conn, _peer, _recorder) = test_connection(Some(gate.clone()));
        let channel = Channel::new("c1", Meta::new(), conn, WorkerPool::new(4), 2);

        // 第一帧被写循环取走并阻塞在 gate 上，之后队列容纳 2 帧
        for i in 0..3u8 {
            channel.push(Bytes::from(vec![i])).await.unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            channel.push(Bytes::from_static(b"x")),
        )
        .await;
        assert!(blocked.is_err());

        gate.add_permits(10);
        tokio::time::timeout(Duration::from_secs(1), channel.push(Bytes::from_static(b"y")))
            .await
            .unwrap()
            .unwrap();
    }
}
