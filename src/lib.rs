//! Ripple IM 公共库
//!
//! 提供各服务共用的配置加载、错误类型、协议帧模型与日志初始化。

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing;
pub mod types;
pub mod utils;

pub use config::{
    AppConfig, AuthConfig, GatewayServiceConfig, LoggingConfig, MessageServiceConfig,
    PostgresInstanceConfig, PresenceServiceConfig, RedisPoolConfig, app_config, load_config,
};
pub use error::{ImError, Result};
pub use protocol::{ChatPayload, Frame, FrameKind, ReadPayload};
pub use tracing::init_tracing_from_config;
pub use types::{ConversationKind, MemberRole};
