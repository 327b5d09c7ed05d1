//! 在线路由注册表
//!
//! 维护 用户 → {设备 → 网关} 的软状态路由表。TTL 过期是主要的垃圾回收
//! 机制：网关崩溃留下的脏路由至多存活一个 TTL 周期，无需全局协调。

pub mod memory;
pub mod model;
pub mod redis;
pub mod registry;

pub use memory::InMemoryRouteRegistry;
pub use model::{DeviceRoute, OnlineStatus};
pub use redis::RedisRouteRegistry;
pub use registry::RouteRegistry;
