//! 连接管理器
//!
//! 进程内全部连接的读写锁表。写方：接入、顶替、清理；读方：广播枚举
//! 与统计。广播先在读锁下拍快照，入队在锁外进行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use ripple_im_core::protocol::Frame;
use ripple_presence::RouteRegistry;

use crate::connection::{ConnKey, Connection};

#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnKey, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接入一个连接；同身份的旧连接先被关闭再腾位
    pub async fn add(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        let key = conn.key();
        if let Some(old) = connections.get(&key) {
            old.close();
            info!(
                user_id = conn.user_id,
                device_id = %conn.device_id,
                "replacing existing connection"
            );
        }
        connections.insert(key, conn.clone());
        info!(
            user_id = conn.user_id,
            device_id = %conn.device_id,
            total_connections = connections.len(),
            "connection added"
        );
    }

    /// 仅当给定连接仍持有条目时将其移除并关闭
    ///
    /// 被顶掉的连接在清理时会返回 false，从而不碰接替者的条目和路由。
    pub async fn remove_if_attached(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        let key = conn.key();
        match connections.get(&key) {
            Some(current) if current.conn_id() == conn.conn_id() => {
                conn.close();
                connections.remove(&key);
                info!(
                    user_id = conn.user_id,
                    device_id = %conn.device_id,
                    total_connections = connections.len(),
                    "connection removed"
                );
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, user_id: i64, device_id: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(&(user_id, device_id.to_string())).cloned()
    }

    /// 读锁下快照该用户的全部连接
    pub async fn user_connections(&self, user_id: i64) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|conn| conn.user_id == user_id)
            .cloned()
            .collect()
    }

    /// 向该用户在本网关的所有设备入队一帧，返回实际入队数
    pub async fn broadcast_to_user(&self, user_id: i64, frame: &Frame) -> usize {
        let targets = self.user_connections(user_id).await;
        // 入队在锁外
        targets
            .iter()
            .filter(|conn| conn.try_send(frame.clone()))
            .count()
    }

    pub async fn total_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 清理一轮空闲连接，返回被清掉的连接
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        let stale: Vec<ConnKey> = connections
            .iter()
            .filter(|(_, conn)| conn.idle_for() > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(conn) = connections.remove(&key) {
                conn.close();
                info!(
                    user_id = conn.user_id,
                    device_id = %conn.device_id,
                    "reaped inactive connection"
                );
                reaped.push(conn);
            }
        }
        if !reaped.is_empty() {
            info!(
                removed = reaped.len(),
                remaining = connections.len(),
                "idle reap completed"
            );
        }
        reaped
    }

    /// 关闭并移除全部连接，用于优雅退出
    pub async fn close_all(&self) -> usize {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        for (_, conn) in connections.drain() {
            conn.close();
        }
        count
    }
}

/// 进程级空闲清理任务：周期扫描，清掉的连接同步注销路由
pub async fn run_reaper(
    manager: Arc<ConnectionManager>,
    registry: Arc<dyn RouteRegistry>,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for conn in manager.reap_idle(idle_timeout).await {
                    if let Err(err) = registry
                        .unregister_route(conn.user_id, &conn.device_id)
                        .await
                    {
                        warn!(
                            user_id = conn.user_id,
                            device_id = %conn.device_id,
                            %err,
                            "failed to unregister route for reaped connection"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("idle reaper exiting");
                    return;
                }
            }
        }
    }
}
