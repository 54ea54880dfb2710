use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// 服务预热状态所在的 meta key
pub const KEY_SERVICE_STATE: &str = "service_state";
/// zone 标签所在的 meta key
pub const KEY_ZONE: &str = "zone";

/// 预热状态：新发现的服务先是 young，预热时间过后变为 adult 才参与路由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Young,
    Adult,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Young => "young",
            ServiceState::Adult => "adult",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务实例信息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// 服务ID
    pub id: String,
    /// 服务名称
    pub name: String,
    /// 对外地址（IP 或域名）
    pub address: String,
    pub port: u16,
    /// 协议：tcp / ws
    pub protocol: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 元数据，包括预热状态和 zone
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        protocol: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// 添加元数据
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// tcp 为 `host:port`，其它协议为 `proto://host:port`
    pub fn dial_url(&self) -> String {
        if self.protocol == "tcp" {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.address, self.port)
        }
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn zone(&self) -> Option<&str> {
        self.meta_value(KEY_ZONE)
    }

    pub fn state(&self) -> Option<ServiceState> {
        match self.meta_value(KEY_SERVICE_STATE)? {
            "young" => Some(ServiceState::Young),
            "adult" => Some(ServiceState::Adult),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id:{},Name:{},Address:{},Port:{},Ns:{},Tags:{:?},Meta:{:?}",
            self.id, self.name, self.address, self.port, self.namespace, self.tags, self.meta
        )
    }
}

/// 到某个依赖服务实例的客户端
#[async_trait]
pub trait ServiceClient: Send + Sync {
    fn service_id(&self) -> &str;

    fn service_name(&self) -> &str;

    /// 服务描述的快照
    fn service(&self) -> ServiceInstance;

    fn set_meta(&self, key: &str, value: &str);

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// 某个依赖服务的全部客户端，按服务 ID 索引
#[derive(Default)]
pub struct ClientMap {
    clients: RwLock<HashMap<String, Arc<dyn ServiceClient>>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Arc<dyn ServiceClient>) {
        self.clients
            .write()
            .insert(client.service_id().to_string(), client);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn ServiceClient>> {
        self.clients.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ServiceClient>> {
        self.clients.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// 全部服务描述
    pub fn services(&self) -> Vec<ServiceInstance> {
        self.clients.read().values().map(|c| c.service()).collect()
    }

    /// meta[key] == value 的服务描述
    pub fn services_with(&self, key: &str, value: &str) -> Vec<ServiceInstance> {
        self.clients
            .read()
            .values()
            .map(|c| c.service())
            .filter(|s| s.meta_value(key) == Some(value))
            .collect()
    }

    pub fn clients(&self) -> Vec<Arc<dyn ServiceClient>> {
        self.clients.read().values().cloned().collect()
    }
}

/// 标记为 young，预热时间后自动变为 adult
pub fn mark_young(client: Arc<dyn ServiceClient>, warmup: Duration) {
    client.set_meta(KEY_SERVICE_STATE, ServiceState::Young.as_str());
    tokio::spawn(async move {
        tokio::time::sleep(warmup).await;
        client.set_meta(KEY_SERVICE_STATE, ServiceState::Adult.as_str());
        tracing::info!(service = %client.service_id(), "service warmed up");
    });
}

/// 直接标记为 adult
pub fn mark_adult(client: &dyn ServiceClient) {
    client.set_meta(KEY_SERVICE_STATE, ServiceState::Adult.as_str());
}
