/// 传输层适配器
///
/// 原始 TCP 与 WebSocket 各自实现 Upgrader/Dialer 以及读写两半

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "tcp")]
pub use tcp::{TcpDialer, TcpUpgrader, StreamFrameReader, StreamFrameWriter};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketDialer, WebSocketUpgrader};
