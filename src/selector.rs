//! 服务实例选择
//!
//! 两种策略：按 channel ID 一致性哈希，以及按 app/account 的 zone 亲和路由。
//! 调用方负责先过滤掉仍在预热的实例。

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    config::{RouteBy, RouteConfig},
    discovery::{ServiceInstance, KEY_ZONE},
    packet::{Header, META_KEY_ACCOUNT, META_KEY_APP},
};

/// zone 内每个实例占用的 slot 数
const INSTANCE_SLOTS: usize = 10;

/// 路由键的 32 位校验和
pub fn hash_code(key: &str) -> u32 {
    crc32c::crc32c(key.as_bytes())
}

/// 从实例池中挑选一个实例，返回其服务 ID；池为空时返回 None
pub trait Selector: Send + Sync {
    fn lookup(&self, header: &Header, services: &[ServiceInstance]) -> Option<String>;
}

fn random_pick(services: &[ServiceInstance]) -> Option<String> {
    if services.is_empty() {
        return None;
    }
    let i = rand::thread_rng().gen_range(0..services.len());
    Some(services[i].id.clone())
}

/// 按 channel ID 哈希取模
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn lookup(&self, header: &Header, services: &[ServiceInstance]) -> Option<String> {
        if services.is_empty() {
            return None;
        }
        let i = hash_code(&header.channel_id) as usize % services.len();
        Some(services[i].id.clone())
    }
}

/// zone 亲和路由
#[derive(Debug, Clone)]
pub struct RouteSelector {
    route: RouteConfig,
}

impl RouteSelector {
    pub fn new(route: RouteConfig) -> Self {
        Self { route }
    }

    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    /// 白名单优先，否则按权重 slot 表哈希
    pub fn zone_of(&self, app: &str, account: &str) -> Option<&str> {
        if let Some(zone) = self.route.whitelist.get(app) {
            debug!(app, zone = %zone, "hit a zone in whitelist");
            return Some(zone);
        }
        let key = match self.route.route_by {
            RouteBy::App => app,
            RouteBy::Account => account,
        };
        let slots = self.route.slots();
        if slots.is_empty() {
            return None;
        }
        let index = slots[hash_code(key) as usize % slots.len()];
        self.route.zones.get(index).map(|z| z.id.as_str())
    }
}

impl Selector for RouteSelector {
    fn lookup(&self, header: &Header, services: &[ServiceInstance]) -> Option<String> {
        let (app, account) = match (
            header.get_meta_str(META_KEY_APP),
            header.get_meta_str(META_KEY_ACCOUNT),
        ) {
            (Some(app), Some(account)) => (app, account),
            _ => return random_pick(services),
        };

        let zone = self.zone_of(app, account).unwrap_or_default();
        let in_zone: Vec<&ServiceInstance> = services
            .iter()
            .filter(|s| s.meta_value(KEY_ZONE) == Some(zone))
            .collect();
        if in_zone.is_empty() {
            warn!(zone, "no service found in zone, select a random one from all");
            return random_pick(services);
        }

        let slots = in_zone.len() * INSTANCE_SLOTS;
        let index = (hash_code(account) as usize % slots) / INSTANCE_SLOTS;
        Some(in_zone[index].id.clone())
    }
}
