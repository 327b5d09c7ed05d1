//! 内存路由注册表，用于单测与单机开发
//!
//! 过期语义与 Redis 实现对齐：TTL 挂在整个用户路由集上，任一注册或
//! 心跳刷新全集。过期条目在访问时惰性清理。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use ripple_im_core::utils::unix_now;
use ripple_im_core::{ImError, Result};

use crate::model::{DeviceRoute, OnlineStatus};
use crate::registry::{DEFAULT_ROUTE_TTL_SECS, RouteRegistry};

struct RouteSet {
    routes: HashMap<String, DeviceRoute>,
    expires_at: Instant,
}

pub struct InMemoryRouteRegistry {
    users: RwLock<HashMap<i64, RouteSet>>,
    ttl: Duration,
}

impl InMemoryRouteRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn expired(set: &RouteSet) -> bool {
        Instant::now() >= set.expires_at
    }
}

impl Default for InMemoryRouteRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_ROUTE_TTL_SECS))
    }
}

#[async_trait]
impl RouteRegistry for InMemoryRouteRegistry {
    async fn register_route(
        &self,
        user_id: i64,
        device_id: &str,
        gateway_addr: &str,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let set = users.entry(user_id).or_insert_with(|| RouteSet {
            routes: HashMap::new(),
            expires_at: Instant::now() + self.ttl,
        });
        if Self::expired(set) {
            set.routes.clear();
        }
        set.routes.insert(
            device_id.to_string(),
            DeviceRoute {
                device_id: device_id.to_string(),
                gateway_addr: gateway_addr.to_string(),
                last_active: unix_now(),
            },
        );
        set.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    async fn heartbeat(&self, user_id: i64, device_id: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let missing = || {
            ImError::NotFound(format!(
                "route not found for user {user_id} device {device_id}"
            ))
        };

        let expired = users.get(&user_id).map(Self::expired);
        match expired {
            None => return Err(missing()),
            Some(true) => {
                users.remove(&user_id);
                return Err(missing());
            }
            Some(false) => {}
        }

        let set = users.get_mut(&user_id).ok_or_else(missing)?;
        let route = set.routes.get_mut(device_id).ok_or_else(missing)?;
        route.last_active = route.last_active.max(unix_now());
        set.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    async fn get_routes(&self, user_id: i64) -> Result<Vec<DeviceRoute>> {
        let mut users = self.users.write().await;
        let routes = match users.get(&user_id) {
            None => return Ok(Vec::new()),
            Some(set) if !Self::expired(set) => set.routes.values().cloned().collect(),
            Some(_) => Vec::new(),
        };
        if routes.is_empty() {
            users.remove(&user_id);
        }
        Ok(routes)
    }

    async fn unregister_route(&self, user_id: i64, device_id: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(set) = users.get_mut(&user_id) {
            set.routes.remove(device_id);
            if set.routes.is_empty() || Self::expired(set) {
                users.remove(&user_id);
            }
        }
        Ok(())
    }

    async fn online_status(&self, user_id: i64) -> Result<OnlineStatus> {
        let routes = self.get_routes(user_id).await?;
        Ok(OnlineStatus {
            online: !routes.is_empty(),
            device_ids: routes.into_iter().map(|r| r.device_id).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryRouteRegistry {
        InMemoryRouteRegistry::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_then_get_routes() {
        let registry = registry();
        registry.register_route(100, "d1", "gw-a:8900").await.unwrap();

        let routes = registry.get_routes(100).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].device_id, "d1");
        assert_eq!(routes[0].gateway_addr, "gw-a:8900");
    }

    #[tokio::test]
    async fn test_unregister_removes_route_and_flips_offline() {
        let registry = registry();
        registry.register_route(100, "d1", "gw-a:8900").await.unwrap();
        registry.register_route(100, "d2", "gw-b:8900").await.unwrap();

        registry.unregister_route(100, "d1").await.unwrap();
        let status = registry.online_status(100).await.unwrap();
        assert!(status.online);
        assert_eq!(status.device_ids, vec!["d2".to_string()]);

        registry.unregister_route(100, "d2").await.unwrap();
        let status = registry.online_status(100).await.unwrap();
        assert!(!status.online);
        assert!(status.device_ids.is_empty());
        assert!(registry.get_routes(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_without_route_fails() {
        let registry = registry();
        let err = registry.heartbeat(100, "d1").await.unwrap_err();
        assert!(matches!(err, ImError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_never_decreases_last_active() {
        let registry = registry();
        registry.register_route(100, "d1", "gw-a:8900").await.unwrap();
        let before = registry.get_routes(100).await.unwrap()[0].last_active;

        registry.heartbeat(100, "d1").await.unwrap();
        let after = registry.get_routes(100).await.unwrap()[0].last_active;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn test_expired_routes_are_invisible() {
        let registry = InMemoryRouteRegistry::new(Duration::ZERO);
        registry.register_route(100, "d1", "gw-a:8900").await.unwrap();

        assert!(registry.get_routes(100).await.unwrap().is_empty());
        assert!(!registry.online_status(100).await.unwrap().online);
        assert!(matches!(
            registry.heartbeat(100, "d1").await,
            Err(ImError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reregister_replaces_same_device() {
        let registry = registry();
        registry.register_route(100, "d1", "gw-a:8900").await.unwrap();
        registry.register_route(100, "d1", "gw-b:8900").await.unwrap();

        let routes = registry.get_routes(100).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway_addr, "gw-b:8900");
    }
}
