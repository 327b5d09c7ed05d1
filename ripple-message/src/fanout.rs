//! 提交后通知扇出
//!
//! 消息落库后异步唤醒接收方：解析会话成员（去掉发送方），逐个向在线
//! 路由注册表查询路由，并把 NOTIFICATION 帧推给路由所指的网关。扇出
//! 与发送方的 ACK 完全解耦，尽力而为；任何失败只记录日志，客户端靠
//! 拉取补齐。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use ripple_im_core::protocol::Frame;
use ripple_im_core::Result;
use ripple_presence::RouteRegistry;

use crate::repository::MessageRepository;

/// 网关推送接口：把一帧投递给指定网关上某用户的全部连接
///
/// 本地网关直接入队，远端网关走对端的内部推送端点。返回实际入队的
/// 连接数。
#[async_trait]
pub trait GatewayPush: Send + Sync {
    async fn push_notification(
        &self,
        gateway_addr: &str,
        user_id: i64,
        frame: &Frame,
    ) -> Result<usize>;
}

pub struct Fanout {
    repo: Arc<dyn MessageRepository>,
    registry: Arc<dyn RouteRegistry>,
    push: Arc<dyn GatewayPush>,
    rpc_timeout: Duration,
}

impl Fanout {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        registry: Arc<dyn RouteRegistry>,
        push: Arc<dyn GatewayPush>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            registry,
            push,
            rpc_timeout,
        }
    }

    /// 对一条已提交的消息执行扇出
    pub async fn dispatch(&self, conv_id: i64, msg_id: &str, seq: i64, sender_id: i64) {
        let member_ids = match self.repo.member_ids(conv_id).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(conv_id, %msg_id, %err, "failed to resolve recipients for fan-out");
                return;
            }
        };

        let recipients: Vec<i64> = member_ids.into_iter().filter(|id| *id != sender_id).collect();
        if recipients.is_empty() {
            return;
        }

        let frame = Frame::notification(conv_id, msg_id, seq, sender_id);
        let mut delivered = 0usize;

        for recipient in recipients {
            let routes = match timeout(self.rpc_timeout, self.registry.get_routes(recipient)).await
            {
                Ok(Ok(routes)) => routes,
                Ok(Err(err)) => {
                    warn!(user_id = recipient, %err, "failed to get routes, skipping recipient");
                    continue;
                }
                Err(_) => {
                    warn!(user_id = recipient, "route lookup timed out, skipping recipient");
                    continue;
                }
            };

            // 同一网关上的多设备由该网关广播一次覆盖
            let gateways: std::collections::BTreeSet<String> =
                routes.into_iter().map(|route| route.gateway_addr).collect();

            for gateway_addr in gateways {
                match timeout(
                    self.rpc_timeout,
                    self.push.push_notification(&gateway_addr, recipient, &frame),
                )
                .await
                {
                    Ok(Ok(count)) => delivered += count,
                    Ok(Err(err)) => warn!(
                        user_id = recipient,
                        %gateway_addr,
                        %err,
                        "notification push failed"
                    ),
                    Err(_) => warn!(
                        user_id = recipient,
                        %gateway_addr,
                        "notification push timed out"
                    ),
                }
            }
        }

        debug!(conv_id, %msg_id, seq, delivered, "fan-out completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_im_core::types::ConversationKind;
    use ripple_im_core::{ImError, protocol::FrameKind};
    use ripple_presence::InMemoryRouteRegistry;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::memory::InMemoryMessageRepository;
    use crate::model::NewMessage;

    struct RecordingPush {
        pushed: Mutex<Vec<(String, i64, Frame)>>,
    }

    #[async_trait]
    impl GatewayPush for RecordingPush {
        async fn push_notification(
            &self,
            gateway_addr: &str,
            user_id: i64,
            frame: &Frame,
        ) -> Result<usize> {
            self.pushed
                .lock()
                .await
                .push((gateway_addr.to_string(), user_id, frame.clone()));
            Ok(1)
        }
    }

    struct FailingPush;

    #[async_trait]
    impl GatewayPush for FailingPush {
        async fn push_notification(&self, _: &str, _: i64, _: &Frame) -> Result<usize> {
            Err(ImError::TransientBackend("gateway unreachable".into()))
        }
    }

    async fn seed_conversation(repo: &InMemoryMessageRepository) -> i64 {
        let conv_id = repo
            .create_conversation(ConversationKind::Group, "g", 100, &[100, 200, 300])
            .await
            .unwrap();
        repo.append_message(&NewMessage {
            msg_id: "m-1".to_string(),
            conv_id,
            sender_id: 100,
            kind: ConversationKind::Group,
            body: json!({"type": "text", "content": "hi"}),
            reply_to: None,
            mentions: Vec::new(),
        })
        .await
        .unwrap();
        conv_id
    }

    #[tokio::test]
    async fn test_dispatch_pushes_to_every_route_except_sender() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let conv_id = seed_conversation(&repo).await;

        let registry = Arc::new(InMemoryRouteRegistry::default());
        registry.register_route(100, "d0", "gw-a:8900").await.unwrap();
        registry.register_route(200, "d1", "gw-a:8900").await.unwrap();
        registry.register_route(200, "d2", "gw-b:8900").await.unwrap();
        // 300 离线

        let push = Arc::new(RecordingPush {
            pushed: Mutex::new(Vec::new()),
        });
        let fanout = Fanout::new(
            repo,
            registry,
            push.clone(),
            Duration::from_secs(5),
        );
        fanout.dispatch(conv_id, "m-1", 1, 100).await;

        let mut pushed: Vec<(String, i64)> = push
            .pushed
            .lock()
            .await
            .iter()
            .map(|(addr, user, _)| (addr.clone(), *user))
            .collect();
        pushed.sort();
        assert_eq!(
            pushed,
            vec![("gw-a:8900".to_string(), 200), ("gw-b:8900".to_string(), 200)]
        );

        let frames = push.pushed.lock().await;
        let frame = &frames[0].2;
        assert_eq!(frame.kind, FrameKind::Notification);
        assert_eq!(frame.payload["conv_id"], conv_id);
        assert_eq!(frame.payload["seq"], 1);
        assert_eq!(frame.payload["sender_id"], 100);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_push_failures() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let conv_id = seed_conversation(&repo).await;

        let registry = Arc::new(InMemoryRouteRegistry::default());
        registry.register_route(200, "d1", "gw-a:8900").await.unwrap();

        let fanout = Fanout::new(
            repo,
            registry,
            Arc::new(FailingPush),
            Duration::from_secs(5),
        );
        // 推送失败不向上传播
        fanout.dispatch(conv_id, "m-1", 1, 100).await;
    }

    #[tokio::test]
    async fn test_dispatch_with_all_recipients_offline_is_noop() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let conv_id = seed_conversation(&repo).await;

        let push = Arc::new(RecordingPush {
            pushed: Mutex::new(Vec::new()),
        });
        let fanout = Fanout::new(
            repo,
            Arc::new(InMemoryRouteRegistry::default()),
            push.clone(),
            Duration::from_secs(5),
        );
        fanout.dispatch(conv_id, "m-1", 1, 100).await;

        assert!(push.pushed.lock().await.is_empty());
    }
}
