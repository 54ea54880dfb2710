/// ximtrans - IM 网关的传输与寻址核心
///
/// 把原始 TCP 或 WebSocket 连接包装成带读写循环的 Channel，承载自定义的二进制数据包；
/// 并提供在多个网关/逻辑服务实例之间定位目标 channel 所需的路由原语。

// 帧与连接
pub mod frame;
pub mod connection;
pub mod adapters;
pub mod pool;

// Channel 与服务端
pub mod channel;
pub mod registry;
pub mod server;
pub mod client;

// 数据包与寻址
pub mod packet;
pub mod location;

// 服务发现与路由
pub mod discovery;
pub mod selector;
pub mod container;

pub mod config;
pub mod error;

// 重新导出核心类型
pub use channel::{Agent, Channel, ChannelState, MessageListener, Meta};
pub use client::Client;
pub use config::{ClientOptions, ConfigError, ContainerOptions, RouteBy, RouteConfig, ServerOptions, Zone};
pub use connection::{Connection, ConnectionInfo, Dialer, DialerContext, FrameRead, FrameWrite, Upgrader};
pub use container::Container;
pub use discovery::{ClientMap, ServiceClient, ServiceInstance, ServiceState};
pub use error::{CloseReason, TransportError};
pub use frame::{Frame, FrameCodec, OpCode};
pub use location::Location;
pub use packet::{BasicPacket, Header, LogicPacket, Packet, PacketError, Status};
pub use pool::{BufferPool, WorkerPool};
pub use registry::ChannelRegistry;
pub use selector::{HashSelector, RouteSelector, Selector};
pub use server::{Acceptor, DefaultAcceptor, Server, ServerBuilder, StateListener};

#[cfg(feature = "tcp")]
pub use adapters::{TcpDialer, TcpUpgrader};
#[cfg(feature = "websocket")]
pub use adapters::{WebSocketDialer, WebSocketUpgrader};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;
