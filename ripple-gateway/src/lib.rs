//! 接入网关
//!
//! 承载客户端长连接：接入鉴权、(user, device) 单连接约束、带丢弃策略的
//! 发送队列、路由心跳与空闲清理，以及帧分发到消息核心。跨网关的通知
//! 推送通过各网关的内部推送端点完成。

pub mod connection;
pub mod dispatcher;
pub mod http;
pub mod identity;
pub mod manager;
pub mod push;
pub mod server;

pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use identity::{AuthClaims, IdentityClient, JwtIdentity};
pub use manager::ConnectionManager;
pub use push::RoutedGatewayPush;
pub use server::{GatewayServer, GatewayState};
