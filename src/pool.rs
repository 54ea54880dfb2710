/// 资源池
///
/// - `BufferPool`：连接读写缓冲区复用，降低高连接抖动下的分配
/// - `WorkerPool`：有界的消息分发任务池

use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use tokio::sync::Semaphore;

use crate::{
    connection::{FrameRead, FrameWrite},
    error::TransportError,
};

/// 默认读缓冲区容量
pub const DEFAULT_READ_BUFFER: usize = 4096;
/// 默认写缓冲区容量
pub const DEFAULT_WRITE_BUFFER: usize = 1024;
/// 超过此容量的缓冲区不回收
const MAX_RECYCLED_CAPACITY: usize = 1024 * 1024;

/// 一条连接独占的一组读写缓冲区
#[derive(Debug, Default)]
pub struct IoBuffers {
    pub read: Option<BytesMut>,
    pub write: Option<BytesMut>,
}

impl IoBuffers {
    pub fn new(read: BytesMut, write: BytesMut) -> Self {
        Self {
            read: Some(read),
            write: Some(write),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn take_read(&mut self) -> BytesMut {
        self.read.take().unwrap_or_default()
    }

    pub fn take_write(&mut self) -> BytesMut {
        self.write.take().unwrap_or_default()
    }

    /// 从读写两半中收回缓冲区
    pub fn reclaim(reader: Option<Box<dyn FrameRead>>, writer: Option<Box<dyn FrameWrite>>) -> Self {
        Self {
            read: reader.and_then(|r| r.into_buffer()),
            write: writer.and_then(|w| w.into_buffer()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// 缓冲池统计
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    pub get_operations: AtomicU64,
    pub return_operations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub discarded: AtomicU64,
}

/// 缓冲池统计快照
#[derive(Debug, Clone, PartialEq)]
pub struct BufferPoolStatsSnapshot {
    pub get_operations: u64,
    pub return_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub discarded: u64,
    pub cache_hit_rate: f64,
}

impl BufferPoolStats {
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let cache_hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };
        BufferPoolStatsSnapshot {
            get_operations: self.get_operations.load(Ordering::Relaxed),
            return_operations: self.return_operations.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            discarded: self.discarded.load(Ordering::Relaxed),
            cache_hit_rate,
        }
    }
}

/// 无锁读写缓冲池
///
/// 每次 `get` 交出的缓冲区归调用方独占，连接服务任务完全退出后才 `put` 回来。
#[derive(Clone)]
pub struct BufferPool {
    read_buffers: Arc<ArrayQueue<BytesMut>>,
    write_buffers: Arc<ArrayQueue<BytesMut>>,
    read_size: usize,
    write_size: usize,
    stats: Arc<BufferPoolStats>,
}

impl BufferPool {
    pub fn new(max_cached: usize) -> Self {
        Self::with_sizes(max_cached, DEFAULT_READ_BUFFER, DEFAULT_WRITE_BUFFER)
    }

    pub fn with_sizes(max_cached: usize, read_size: usize, write_size: usize) -> Self {
        let max_cached = max_cached.max(1);
        Self {
            read_buffers: Arc::new(ArrayQueue::new(max_cached)),
            write_buffers: Arc::new(ArrayQueue::new(max_cached)),
            read_size,
            write_size,
            stats: Arc::new(BufferPoolStats::default()),
        }
    }

    /// 取一组缓冲区，池空时新分配
    pub fn get(&self) -> IoBuffers {
        self.stats.get_operations.fetch_add(1, Ordering::Relaxed);
        let read = self.take(&self.read_buffers, self.read_size);
        let write = self.take(&self.write_buffers, self.write_size);
        IoBuffers::new(read, write)
    }

    fn take(&self, queue: &ArrayQueue<BytesMut>, capacity: usize) -> BytesMut {
        match queue.pop() {
            Some(mut buffer) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                buffer
            }
            None => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(capacity)
            }
        }
    }

    /// 归还缓冲区；异常容量或池已满时直接丢弃
    pub fn put(&self, buffers: IoBuffers) {
        if buffers.is_empty() {
            return;
        }
        self.stats.return_operations.fetch_add(1, Ordering::Relaxed);
        if let Some(read) = buffers.read {
            self.recycle(&self.read_buffers, read);
        }
        if let Some(write) = buffers.write {
            self.recycle(&self.write_buffers, write);
        }
    }

    fn recycle(&self, queue: &ArrayQueue<BytesMut>, mut buffer: BytesMut) {
        if buffer.capacity() == 0 || buffer.capacity() > MAX_RECYCLED_CAPACITY {
            tracing::trace!(capacity = buffer.capacity(), "discard buffer");
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buffer.clear();
        if queue.push(buffer).is_err() {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cached(&self) -> (usize, usize) {
        (self.read_buffers.len(), self.write_buffers.len())
    }

    pub fn stats(&self) -> BufferPoolStatsSnapshot {
        self.stats.snapshot()
    }
}

/// 有界任务池：同时运行的任务数不超过 `size`，满时 `submit` 等待
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// 提交一个任务；池关闭后返回错误
    pub async fn submit<F>(&self, task: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::connection_error("worker pool is closed", false))?;
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    /// 拒绝后续提交，已在运行的任务不受影响
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
