/// Channel 注册表
///
/// 分片的并发 map：每个分片一把读写锁，不相关的连接落在不同分片上互不阻塞。

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;

use crate::{channel::Channel, error::TransportError};

const DEFAULT_SHARDS: usize = 16;

/// 注册表统计
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub added: AtomicU64,
    pub removed: AtomicU64,
    pub rejected: AtomicU64,
}

pub struct ChannelRegistry {
    shards: Vec<CachePadded<RwLock<HashMap<String, Arc<Channel>>>>>,
    shard_count: usize,
    stats: RegistryStats,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// 分片数向上取整为 2 的幂
    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(RwLock::new(HashMap::new())))
            .collect();
        Self {
            shards,
            shard_count,
            stats: RegistryStats::default(),
        }
    }

    fn shard(&self, id: &str) -> &RwLock<HashMap<String, Arc<Channel>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (self.shard_count - 1)]
    }

    /// 注册；ID 已存在时拒绝，保留先注册的 channel
    pub fn add(&self, channel: Arc<Channel>) -> Result<(), TransportError> {
        let mut shard = self.shard(channel.id()).write();
        if shard.contains_key(channel.id()) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::DuplicateChannel {
                id: channel.id().to_string(),
            });
        }
        shard.insert(channel.id().to_string(), channel);
        self.stats.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        let removed = self.shard(id).write().remove(id);
        if removed.is_some() {
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// 只有登记的正是这个 channel 实例时才移除
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> bool {
        let mut shard = self.shard(channel.id()).write();
        match shard.get(channel.id()) {
            Some(current) if Arc::ptr_eq(current, channel) => {
                shard.remove(channel.id());
                self.stats.removed.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.shard(id).read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shard(id).read().contains_key(id)
    }

    /// 所有 channel 的快照，逐个分片加读锁
    pub fn all(&self) -> Vec<Arc<Channel>> {
        let mut all = Vec::with_capacity(self.len());
        for shard in &self.shards {
            all.extend(shard.read().values().cloned());
        }
        all
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
