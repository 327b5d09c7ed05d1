//! Redis 路由注册表实现
//!
//! 存储形态：每用户一个 hash `route:{user_id}`，field 为 device_id，
//! value 为 JSON 编码的路由；TTL 作用于整个用户 key。另有字符串
//! `presence:{user_id}` 作为在线标记，随路由一同刷新。

use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

use async_trait::async_trait;
use ripple_im_core::utils::unix_now;
use ripple_im_core::{ImError, Result};

use crate::model::{DeviceRoute, OnlineStatus};
use crate::registry::RouteRegistry;

const ROUTE_KEY_PREFIX: &str = "route:";
const PRESENCE_KEY_PREFIX: &str = "presence:";

pub struct RedisRouteRegistry {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisRouteRegistry {
    /// 建立到 Redis 的连接并返回注册表
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|err| ImError::backend("open redis client", err))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|err| ImError::backend("connect to redis", err))?;
        Ok(Self { conn, ttl_secs })
    }

    fn route_key(user_id: i64) -> String {
        format!("{ROUTE_KEY_PREFIX}{user_id}")
    }

    fn presence_key(user_id: i64) -> String {
        format!("{PRESENCE_KEY_PREFIX}{user_id}")
    }

    /// 刷新用户路由集与在线标记的 TTL
    async fn refresh_ttl(&self, conn: &mut ConnectionManager, user_id: i64) -> Result<()> {
        let _: bool = conn
            .expire(Self::route_key(user_id), self.ttl_secs as i64)
            .await
            .map_err(|err| ImError::backend("refresh route ttl", err))?;
        let _: () = conn
            .set_ex(Self::presence_key(user_id), "online", self.ttl_secs)
            .await
            .map_err(|err| ImError::backend("refresh presence marker", err))?;
        Ok(())
    }
}

#[async_trait]
impl RouteRegistry for RedisRouteRegistry {
    async fn register_route(
        &self,
        user_id: i64,
        device_id: &str,
        gateway_addr: &str,
    ) -> Result<()> {
        let route = DeviceRoute {
            device_id: device_id.to_string(),
            gateway_addr: gateway_addr.to_string(),
            last_active: unix_now(),
        };
        let payload = serde_json::to_string(&route)
            .map_err(|err| ImError::internal("encode route", err))?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(Self::route_key(user_id), device_id, payload)
            .await
            .map_err(|err| ImError::backend("store route", err))?;
        self.refresh_ttl(&mut conn, user_id).await?;

        debug!(user_id, device_id, gateway_addr, "route registered");
        Ok(())
    }

    async fn heartbeat(&self, user_id: i64, device_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::route_key(user_id);

        let raw: Option<String> = conn
            .hget(&key, device_id)
            .await
            .map_err(|err| ImError::backend("read route", err))?;
        let Some(raw) = raw else {
            // 报告给调用方，让网关强制重新注册
            return Err(ImError::NotFound(format!(
                "route not found for user {user_id} device {device_id}"
            )));
        };

        let mut route: DeviceRoute = serde_json::from_str(&raw)
            .map_err(|err| ImError::internal("decode route", err))?;
        route.last_active = unix_now();
        let payload = serde_json::to_string(&route)
            .map_err(|err| ImError::internal("encode route", err))?;

        let _: () = conn
            .hset(&key, device_id, payload)
            .await
            .map_err(|err| ImError::backend("refresh route", err))?;
        self.refresh_ttl(&mut conn, user_id).await
    }

    async fn get_routes(&self, user_id: i64) -> Result<Vec<DeviceRoute>> {
        let mut conn = self.conn.clone();
        let entries: std::collections::HashMap<String, String> = conn
            .hgetall(Self::route_key(user_id))
            .await
            .map_err(|err| ImError::backend("read routes", err))?;

        let mut routes = Vec::with_capacity(entries.len());
        for (device_id, raw) in entries {
            match serde_json::from_str::<DeviceRoute>(&raw) {
                Ok(route) => routes.push(route),
                Err(err) => warn!(user_id, %device_id, %err, "skipping undecodable route"),
            }
        }
        Ok(routes)
    }

    async fn unregister_route(&self, user_id: i64, device_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::route_key(user_id);

        let _: usize = conn
            .hdel(&key, device_id)
            .await
            .map_err(|err| ImError::backend("delete route", err))?;

        let remaining: usize = conn
            .hlen(&key)
            .await
            .map_err(|err| ImError::backend("count routes", err))?;
        if remaining == 0 {
            let _: usize = conn
                .del(&key)
                .await
                .map_err(|err| ImError::backend("delete route set", err))?;
            let _: () = conn
                .set_ex(Self::presence_key(user_id), "offline", self.ttl_secs)
                .await
                .map_err(|err| ImError::backend("flip presence marker", err))?;
        }

        debug!(user_id, device_id, "route unregistered");
        Ok(())
    }

    async fn online_status(&self, user_id: i64) -> Result<OnlineStatus> {
        let mut conn = self.conn.clone();
        let device_ids: Vec<String> = conn
            .hkeys(Self::route_key(user_id))
            .await
            .map_err(|err| ImError::backend("read device ids", err))?;
        Ok(OnlineStatus {
            online: !device_ids.is_empty(),
            device_ids,
        })
    }
}
