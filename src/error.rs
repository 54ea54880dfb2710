use std::time::Duration;

use crate::packet::PacketError;

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 读超时（心跳丢失）
    Timeout,
    /// 对端发送了 Close 帧
    Remote,
    /// 错误
    Error(String),
}

impl CloseReason {
    /// Classify the error that ended a read loop.
    pub fn from_error(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout { .. } => CloseReason::Timeout,
            TransportError::RemoteClosed { .. } => CloseReason::Remote,
            other => CloseReason::Error(other.to_string()),
        }
    }
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 连接相关错误 (socket I/O)
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// 握手失败
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    /// 对端关闭了 channel
    #[error("remote side closed the channel {id}")]
    RemoteClosed { id: String },

    /// Push 到一个已关闭的 channel
    #[error("channel {id} has closed")]
    ChannelClosed { id: String },

    /// ReadLoop 重复启动
    #[error("channel {id} has already started")]
    AlreadyStarted { id: String },

    /// Close 重复调用
    #[error("channel {id} is already closed")]
    AlreadyClosed { id: String },

    /// 注册表中已存在同 ID 的 channel
    #[error("channel ID {id} is duplicate")]
    DuplicateChannel { id: String },

    /// 注册表中不存在该 channel
    #[error("channel {id} not found")]
    ChannelNotFound { id: String },

    /// 依赖服务没有可用的实例
    #[error("no service found for {service}")]
    ServiceNotFound { service: String },
}

impl TransportError {
    /// 判断错误是否可重试
    ///
    /// The crate itself never retries; this is a hint for the layer that owns
    /// reconnect policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Timeout { .. } => true,
            TransportError::Protocol { .. }
            | TransportError::Configuration { .. }
            | TransportError::Handshake { .. }
            | TransportError::RemoteClosed { .. }
            | TransportError::ChannelClosed { .. }
            | TransportError::AlreadyStarted { .. }
            | TransportError::AlreadyClosed { .. }
            | TransportError::DuplicateChannel { .. }
            | TransportError::ChannelNotFound { .. }
            | TransportError::ServiceNotFound { .. } => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::Handshake { .. } => "HANDSHAKE_ERROR",
            TransportError::RemoteClosed { .. } => "REMOTE_CLOSED",
            TransportError::ChannelClosed { .. } => "CHANNEL_CLOSED",
            TransportError::AlreadyStarted { .. } => "ALREADY_STARTED",
            TransportError::AlreadyClosed { .. } => "ALREADY_CLOSED",
            TransportError::DuplicateChannel { .. } => "DUPLICATE_CHANNEL",
            TransportError::ChannelNotFound { .. } => "CHANNEL_NOT_FOUND",
            TransportError::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
        }
    }

    /// Transport-class errors are fatal to the channel they occur on.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::Timeout { .. }
        )
    }

    /// 添加 channel 上下文
    pub fn with_channel(mut self, id: &str) -> Self {
        match &mut self {
            TransportError::Connection { reason, .. } | TransportError::Protocol { reason, .. } => {
                if !reason.contains("channel:") {
                    *reason = format!("{} (channel: {})", reason, id);
                }
            }
            _ => {}
        }
        self
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// 创建握手错误
    pub fn handshake_error(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }
}

/// 从标准IO错误转换
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match error {
            WsError::Io(io_err) => io_err.into(),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::connection_error("WebSocket connection closed", false)
            }
            other => TransportError::protocol_error("websocket", other.to_string()),
        }
    }
}

impl From<PacketError> for TransportError {
    fn from(error: PacketError) -> Self {
        TransportError::protocol_error("packet", error.to_string())
    }
}

impl From<crate::config::ConfigError> for TransportError {
    fn from(error: crate::config::ConfigError) -> Self {
        TransportError::config_error(error.field(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_errors_are_named_and_not_retryable() {
        let errors = [
            TransportError::AlreadyStarted { id: "c1".into() },
            TransportError::AlreadyClosed { id: "c1".into() },
            TransportError::DuplicateChannel { id: "c1".into() },
            TransportError::ChannelClosed { id: "c1".into() },
        ];
        for error in errors {
            assert!(!error.is_retryable());
            assert!(!error.is_transport());
        }
        assert_eq!(
            TransportError::DuplicateChannel { id: "c1".into() }.to_string(),
            "channel ID c1 is duplicate"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_retryable());
        assert!(err.is_transport());
        assert_eq!(err.error_code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_close_reason_classification() {
        let timeout = TransportError::timeout_error("read_frame", Duration::from_secs(1));
        assert_eq!(CloseReason::from_error(&timeout), CloseReason::Timeout);

        let remote = TransportError::RemoteClosed { id: "c1".into() };
        assert_eq!(CloseReason::from_error(&remote), CloseReason::Remote);
    }

    #[test]
    fn test_context_helpers() {
        let err = TransportError::connection_error("broken pipe", false)
            .with_channel("c9")
            .with_channel("c9");
        let text = err.to_string();
        assert_eq!(text.matches("channel: c9").count(), 1);
    }
}
