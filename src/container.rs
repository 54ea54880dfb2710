//! 服务容器
//!
//! 进程启动时创建一次，持有本服务的 [`Server`] 以及所有依赖服务的客户端，
//! 负责把消息转发到依赖服务，或把依赖服务推回来的消息投递到本地 channel。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    config::{ClientOptions, ContainerOptions},
    connection::Dialer,
    discovery::{mark_adult, mark_young, ClientMap, ServiceClient, ServiceInstance, ServiceState, KEY_SERVICE_STATE},
    error::TransportError,
    frame::OpCode,
    packet::{read_logic_packet, Header, LogicPacket, Packet, META_DEST_CHANNELS, META_DEST_SERVER},
    selector::{HashSelector, Selector},
    server::Server,
};

pub struct Container {
    server: Arc<Server>,
    options: ContainerOptions,
    client_options: RwLock<ClientOptions>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    selector: RwLock<Arc<dyn Selector>>,
    dependencies: RwLock<HashMap<String, Arc<ClientMap>>>,
}

impl Container {
    pub fn new(server: Arc<Server>, options: ContainerOptions) -> Arc<Self> {
        Arc::new(Self {
            server,
            options,
            client_options: RwLock::new(ClientOptions::default()),
            dialer: RwLock::new(None),
            selector: RwLock::new(Arc::new(HashSelector)),
            dependencies: RwLock::new(HashMap::new()),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn service_id(&self) -> &str {
        self.server.service_id()
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// 声明一个依赖服务
    pub fn add_dependency(&self, service_name: impl Into<String>) {
        self.dependencies
            .write()
            .entry(service_name.into())
            .or_insert_with(|| Arc::new(ClientMap::new()));
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.read().keys().cloned().collect()
    }

    pub fn client_map(&self, service_name: &str) -> Option<Arc<ClientMap>> {
        self.dependencies.read().get(service_name).cloned()
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write() = selector;
    }

    /// 不设置时按服务协议选择默认拨号器
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    pub fn set_client_options(&self, options: ClientOptions) -> Result<(), TransportError> {
        options.validate()?;
        *self.client_options.write() = options;
        Ok(())
    }

    /// 登记一个已连接的依赖服务客户端
    ///
    /// `fresh` 表示运行期间新发现的实例：先标记为 young，预热时间后才参与路由。
    pub fn add_client(&self, client: Arc<dyn ServiceClient>, fresh: bool) -> Result<(), TransportError> {
        let clients = self.client_map(client.service_name()).ok_or_else(|| {
            TransportError::ServiceNotFound {
                service: client.service_name().to_string(),
            }
        })?;
        if fresh {
            mark_young(client.clone(), self.options.warmup_delay);
        } else {
            mark_adult(&*client);
        }
        info!(service = %client.service_id(), name = %client.service_name(), fresh, "dependency client added");
        clients.add(client);
        Ok(())
    }

    /// 连接一个依赖服务实例，并启动读循环接收它推回来的消息
    pub async fn connect_service(
        self: &Arc<Self>,
        service: ServiceInstance,
        fresh: bool,
    ) -> Result<(), TransportError> {
        let clients = self.client_map(&service.name).ok_or_else(|| TransportError::ServiceNotFound {
            service: service.name.clone(),
        })?;
        if clients.contains(&service.id) {
            debug!(service = %service.id, "dependency already connected");
            return Ok(());
        }

        let dialer = match self.dialer.read().clone() {
            Some(dialer) => dialer,
            None => default_dialer(&service.protocol)?,
        };
        let address = service.dial_url();
        let client = Client::new(
            self.server.service_id(),
            self.server.service_name(),
            service,
            self.client_options.read().clone(),
            dialer,
        );
        client.connect(&address).await?;

        let container = self.clone();
        let reader = client.clone();
        tokio::spawn(async move {
            container.client_read_loop(reader).await;
        });

        self.add_client(client, fresh)
    }

    /// 断开并移除一个依赖服务实例
    pub async fn disconnect_service(&self, service_name: &str, id: &str) -> Result<(), TransportError> {
        let client = self
            .client_map(service_name)
            .and_then(|clients| clients.remove(id));
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    async fn client_read_loop(&self, client: Arc<Client>) {
        loop {
            let frame = match client.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    info!(service = %client.service_id(), error = %e, "dependency read loop exited");
                    break;
                }
            };
            if frame.opcode != OpCode::Binary {
                continue;
            }
            let mut payload = frame.into_payload();
            let packet = match read_logic_packet(&mut payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(service = %client.service_id(), error = %e, "invalid packet from dependency");
                    continue;
                }
            };
            if let Err(e) = self.push_message(packet).await {
                warn!(service = %client.service_id(), error = %e, "push message failed");
            }
        }

        if let Some(clients) = self.client_map(client.service_name()) {
            clients.remove(client.service_id());
        }
        let _ = client.close().await;
    }

    /// 在依赖服务 `service_name` 的 adult 实例中选出一个客户端
    pub fn lookup(
        &self,
        service_name: &str,
        header: &Header,
        selector: &dyn Selector,
    ) -> Result<Arc<dyn ServiceClient>, TransportError> {
        let not_found = || TransportError::ServiceNotFound {
            service: service_name.to_string(),
        };
        let clients = self.client_map(service_name).ok_or_else(not_found)?;
        let services = clients.services_with(KEY_SERVICE_STATE, ServiceState::Adult.as_str());
        if services.is_empty() {
            return Err(not_found());
        }
        let id = selector.lookup(header, &services).ok_or_else(not_found)?;
        clients.get(&id).ok_or_else(not_found)
    }

    /// 用默认选择器转发到依赖服务
    pub async fn forward(&self, service_name: &str, packet: LogicPacket) -> Result<(), TransportError> {
        let selector = self.selector.read().clone();
        self.forward_with_selector(service_name, packet, selector.as_ref())
            .await
    }

    /// 标记 `dest.server` 为本服务后发给选中的实例，对方据此把响应推回来
    pub async fn forward_with_selector(
        &self,
        service_name: &str,
        mut packet: LogicPacket,
        selector: &dyn Selector,
    ) -> Result<(), TransportError> {
        if packet.command().is_empty() {
            return Err(TransportError::protocol_error("logic", "command is empty in packet"));
        }
        if packet.channel_id().is_empty() {
            return Err(TransportError::protocol_error("logic", "channel id is empty in packet"));
        }

        let client = self.lookup(service_name, &packet.header, selector)?;
        packet.add_string_meta(META_DEST_SERVER, self.server.service_id());
        debug!(
            service = %client.service_id(),
            command = %packet.command(),
            channel = %packet.channel_id(),
            "forward message"
        );
        let payload = Packet::Logic(packet).marshal()?;
        client.send(payload).await
    }

    /// 推送到连接在本服务上的某个服务端（其 channel ID 即服务 ID）
    pub async fn push(&self, server: &str, mut packet: LogicPacket) -> Result<(), TransportError> {
        packet.add_string_meta(META_DEST_SERVER, server);
        let payload = Packet::Logic(packet).marshal()?;
        self.server.push(server, payload).await
    }

    /// 把依赖服务推回来的消息投递给本地 channel
    ///
    /// `dest.channels` 是逗号分隔的 channel ID 列表。单个 channel 推送失败只记日志。
    pub async fn push_message(&self, mut packet: LogicPacket) -> Result<(), TransportError> {
        let own = self.server.service_id();
        match packet.header.get_meta_str(META_DEST_SERVER) {
            Some(server) if server == own => {}
            Some(server) => {
                return Err(TransportError::protocol_error(
                    "logic",
                    format!("dest_server is incorrect, {} != {}", server, own),
                ))
            }
            None => return Err(TransportError::protocol_error("logic", "dest_server is nil")),
        }
        let channels: Vec<String> = match packet.header.get_meta_str(META_DEST_CHANNELS) {
            Some(list) => list.split(',').map(str::to_string).collect(),
            None => return Err(TransportError::protocol_error("logic", "dest_channels is nil")),
        };

        packet.del_meta(META_DEST_SERVER);
        packet.del_meta(META_DEST_CHANNELS);
        let payload: Bytes = Packet::Logic(packet).marshal()?;

        for channel in channels.iter().filter(|c| !c.is_empty()) {
            if let Err(e) = self.server.push(channel, payload.clone()).await {
                debug!(channel = %channel, error = %e, "push to channel failed");
            }
        }
        Ok(())
    }

    /// 关闭服务端以及所有依赖服务客户端
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TransportError> {
        let result = self.server.shutdown(timeout).await;
        let maps: Vec<Arc<ClientMap>> = self.dependencies.read().values().cloned().collect();
        for clients in maps {
            for client in clients.clients() {
                clients.remove(client.service_id());
                if let Err(e) = client.close().await {
                    debug!(service = %client.service_id(), error = %e, "close client failed");
                }
            }
        }
        result
    }
}

fn default_dialer(protocol: &str) -> Result<Arc<dyn Dialer>, TransportError> {
    match protocol {
        #[cfg(feature = "tcp")]
        "tcp" | "" => Ok(Arc::new(crate::adapters::TcpDialer)),
        #[cfg(feature = "websocket")]
        "ws" | "websocket" => Ok(Arc::new(crate::adapters::WebSocketDialer)),
        other => Err(TransportError::config_error(
            "protocol",
            format!("unsupported protocol {}", other),
        )),
    }
}
