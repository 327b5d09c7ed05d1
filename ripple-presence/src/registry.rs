//! 路由注册表接口

use async_trait::async_trait;

use ripple_im_core::Result;

use crate::model::{DeviceRoute, OnlineStatus};

/// 路由与在线标记的默认 TTL（秒）
pub const DEFAULT_ROUTE_TTL_SECS: u64 = 60;

/// 在线路由注册表
///
/// 写入不做全局串行化：同一 (user, device) 的并发注册任取其一，
/// 由 TTL 兜底。心跳失败（路由不存在）必须报告给调用方，以便网关
/// 立即重新注册。
#[async_trait]
pub trait RouteRegistry: Send + Sync {
    /// 写入或刷新一条设备路由，同时刷新该用户路由集与在线标记的 TTL
    async fn register_route(
        &self,
        user_id: i64,
        device_id: &str,
        gateway_addr: &str,
    ) -> Result<()>;

    /// 刷新已有路由的 last_active 与 TTL；路由不存在时返回 NotFound
    async fn heartbeat(&self, user_id: i64, device_id: &str) -> Result<()>;

    /// 返回用户所有未过期的路由；离线时为空
    async fn get_routes(&self, user_id: i64) -> Result<Vec<DeviceRoute>>;

    /// 移除一个设备的路由；若为最后一个设备则将在线标记翻转为离线
    async fn unregister_route(&self, user_id: i64, device_id: &str) -> Result<()>;

    /// 查询在线状态与在线设备列表
    async fn online_status(&self, user_id: i64) -> Result<OnlineStatus>;
}
