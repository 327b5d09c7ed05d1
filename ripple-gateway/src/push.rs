//! 通知推送
//!
//! 扇出得到的路由指向某个网关地址：指向本网关时直接走连接管理器入队，
//! 指向其他网关时调用对端的内部推送端点。出站请求统一带超时。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ripple_im_core::protocol::Frame;
use ripple_im_core::{ImError, Result};
use ripple_message::GatewayPush;

use crate::manager::ConnectionManager;

/// `/internal/push` 的请求体
#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub user_id: i64,
    pub frame: Frame,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub delivered: usize,
}

pub struct RoutedGatewayPush {
    self_addr: String,
    manager: Arc<ConnectionManager>,
    http: reqwest::Client,
}

impl RoutedGatewayPush {
    pub fn new(
        self_addr: &str,
        manager: Arc<ConnectionManager>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ImError::internal("build http client", err))?;
        Ok(Self {
            self_addr: self_addr.to_string(),
            manager,
            http,
        })
    }
}

#[async_trait]
impl GatewayPush for RoutedGatewayPush {
    async fn push_notification(
        &self,
        gateway_addr: &str,
        user_id: i64,
        frame: &Frame,
    ) -> Result<usize> {
        if gateway_addr == self.self_addr {
            let delivered = self.manager.broadcast_to_user(user_id, frame).await;
            debug!(user_id, delivered, "notification delivered locally");
            return Ok(delivered);
        }

        let url = format!("http://{gateway_addr}/internal/push");
        let response = self
            .http
            .post(&url)
            .json(&PushRequest {
                user_id,
                frame: frame.clone(),
            })
            .send()
            .await
            .map_err(|err| ImError::backend("push to peer gateway", err))?;

        if !response.status().is_success() {
            return Err(ImError::TransientBackend(format!(
                "peer gateway {gateway_addr} returned {}",
                response.status()
            )));
        }

        let body: PushResponse = response
            .json()
            .await
            .map_err(|err| ImError::backend("decode push response", err))?;
        debug!(
            user_id,
            gateway_addr,
            delivered = body.delivered,
            "notification forwarded to peer gateway"
        );
        Ok(body.delivered)
    }
}
