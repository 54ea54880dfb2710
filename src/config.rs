/// 配置类型
///
/// 服务端、客户端、容器与路由的选项结构，均支持 serde 序列化并在 build/validate 时校验

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 默认登录（握手）超时
pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(10);
/// 默认读超时（心跳丢失判定）
pub const DEFAULT_READ_WAIT: Duration = Duration::from_secs(3 * 60);
/// 默认写超时
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// 客户端默认心跳间隔
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(55);
/// 消息分发协程池大小
pub const DEFAULT_MESSAGE_POOL: usize = 5000;
/// 连接处理协程池大小
pub const DEFAULT_CONNECTION_POOL: usize = 5000;
/// channel 出站队列容量
pub const DEFAULT_OUTBOUND_QUEUE: usize = 5;
/// 新发现服务的预热时间
pub const DEFAULT_WARMUP_DELAY: Duration = Duration::from_secs(10);

/// 配置错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("Missing required field: {field}. {suggestion}")]
    MissingField { field: String, suggestion: String },

    #[error("Configuration conflict: {message}")]
    Conflict { message: String },

    #[error("Failed to load {path}: {reason}")]
    Load { path: String, reason: String },
}

impl ConfigError {
    /// 出错的字段名
    pub fn field(&self) -> &str {
        match self {
            ConfigError::InvalidValue { field, .. } | ConfigError::MissingField { field, .. } => {
                field
            }
            ConfigError::Conflict { .. } => "config",
            ConfigError::Load { path, .. } => path,
        }
    }

    fn invalid(
        field: &str,
        value: impl ToString,
        reason: &str,
        suggestion: &str,
    ) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// Duration 以毫秒整数序列化
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// 服务端选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// 握手超时
    #[serde(with = "duration_ms")]
    pub login_wait: Duration,
    /// 读超时，每读一帧重置
    #[serde(with = "duration_ms")]
    pub read_wait: Duration,
    /// 写超时，每写一帧重置
    #[serde(with = "duration_ms")]
    pub write_wait: Duration,
    /// 消息分发并发上限
    pub message_pool: usize,
    /// 同时处理的连接上限
    pub connection_pool: usize,
    /// 每个 channel 的出站队列容量
    pub outbound_queue: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            login_wait: DEFAULT_LOGIN_WAIT,
            read_wait: DEFAULT_READ_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            message_pool: DEFAULT_MESSAGE_POOL,
            connection_pool: DEFAULT_CONNECTION_POOL,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login_wait(mut self, wait: Duration) -> Self {
        self.login_wait = wait;
        self
    }

    pub fn read_wait(mut self, wait: Duration) -> Self {
        self.read_wait = wait;
        self
    }

    pub fn write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    pub fn message_pool(mut self, size: usize) -> Self {
        self.message_pool = size;
        self
    }

    pub fn connection_pool(mut self, size: usize) -> Self {
        self.connection_pool = size;
        self
    }

    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, wait) in [
            ("login_wait", self.login_wait),
            ("read_wait", self.read_wait),
            ("write_wait", self.write_wait),
        ] {
            if wait.is_zero() {
                return Err(ConfigError::invalid(
                    field,
                    "0ms",
                    "timeout must be positive",
                    "use a value in milliseconds greater than 0",
                ));
            }
        }
        for (field, size) in [
            ("message_pool", self.message_pool),
            ("connection_pool", self.connection_pool),
            ("outbound_queue", self.outbound_queue),
        ] {
            if size == 0 {
                return Err(ConfigError::invalid(
                    field,
                    size,
                    "must be greater than 0",
                    "keep the default unless there is a reason to change it",
                ));
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

/// 客户端选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// 心跳间隔，0 表示不发心跳
    #[serde(with = "duration_ms")]
    pub heartbeat: Duration,
    /// 读超时，仅在启用心跳时生效
    #[serde(with = "duration_ms")]
    pub read_wait: Duration,
    #[serde(with = "duration_ms")]
    pub write_wait: Duration,
    /// 建连加握手的超时
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            read_wait: DEFAULT_READ_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            dial_timeout: DEFAULT_LOGIN_WAIT,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn read_wait(mut self, wait: Duration) -> Self {
        self.read_wait = wait;
        self
    }

    pub fn write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_wait.is_zero() {
            return Err(ConfigError::invalid(
                "write_wait",
                "0ms",
                "timeout must be positive",
                "use a value in milliseconds greater than 0",
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "dial_timeout",
                "0ms",
                "timeout must be positive",
                "use a value in milliseconds greater than 0",
            ));
        }
        if !self.heartbeat.is_zero() && self.read_wait <= self.heartbeat {
            return Err(ConfigError::Conflict {
                message: format!(
                    "read_wait {:?} must be longer than heartbeat {:?}",
                    self.read_wait, self.heartbeat
                ),
            });
        }
        Ok(())
    }

    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

/// 容器选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// 新发现的服务在 young 状态停留的时间
    #[serde(with = "duration_ms")]
    pub warmup_delay: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            warmup_delay: DEFAULT_WARMUP_DELAY,
        }
    }
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = delay;
        self
    }
}

/// 路由分区
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub weight: u32,
}

/// 白名单条目：app -> zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub key: String,
    pub value: String,
}

/// 按哪个 meta 字段计算分区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteBy {
    App,
    #[default]
    Account,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RouteFile {
    #[serde(default)]
    route_by: RouteBy,
    #[serde(default)]
    zones: Vec<Zone>,
    #[serde(default)]
    whitelist: Vec<WhitelistEntry>,
}

/// zone 亲和路由配置
///
/// 加载时按权重展开 slot 表：每个 zone 的下标重复 weight 次。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub route_by: RouteBy,
    pub zones: Vec<Zone>,
    pub whitelist: HashMap<String, String>,
    slots: Vec<usize>,
}

impl RouteConfig {
    pub fn new(
        route_by: RouteBy,
        zones: Vec<Zone>,
        whitelist: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let slots = zones
            .iter()
            .enumerate()
            .flat_map(|(i, zone)| std::iter::repeat(i).take(zone.weight as usize))
            .collect::<Vec<_>>();
        let config = Self {
            route_by,
            zones,
            whitelist,
            slots,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let file: RouteFile = serde_json::from_str(text).map_err(|e| ConfigError::Load {
            path: "route".to_string(),
            reason: e.to_string(),
        })?;
        let whitelist = file
            .whitelist
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        Self::new(file.route_by, file.zones, whitelist)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// 按权重展开的 zone 下标表
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zones.is_empty() {
            return Err(ConfigError::MissingField {
                field: "zones".to_string(),
                suggestion: "declare at least one zone".to_string(),
            });
        }
        if self.slots.is_empty() {
            return Err(ConfigError::invalid(
                "zones.weight",
                0,
                "total weight is zero",
                "give at least one zone a positive weight",
            ));
        }
        for (app, zone) in &self.whitelist {
            if !self.zones.iter().any(|z| &z.id == zone) {
                return Err(ConfigError::invalid(
                    "whitelist",
                    format!("{} -> {}", app, zone),
                    "zone is not declared",
                    "add the zone to zones or fix the whitelist entry",
                ));
            }
        }
        Ok(())
    }
}
