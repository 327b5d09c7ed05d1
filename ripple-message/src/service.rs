//! 消息核心服务
//!
//! 网关侧调用的一元接口。发言权限在这里裁决（成员资格 + 角色×会话
//! 类型策略表），seq 分配与落库委托存储层的原子作用域，扇出在提交后
//! 异步触发，发送方的 ACK 不等待它。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use ripple_im_core::{ConversationKind, ImError, Result};

use crate::fanout::Fanout;
use crate::model::{
    Conversation, ConversationMember, MAX_PULL_LIMIT, NewMessage, PulledMessages, SendReceipt,
};
use crate::repository::MessageRepository;

/// 消息核心一元接口
///
/// 未知会话类型在字符串进入类型系统的边界处（帧解析 / HTTP 反序列化）
/// 即被拒绝为 InvalidArgument，因此这里的 `kind` 恒为合法值。
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn send(
        &self,
        conv_id: i64,
        sender_id: i64,
        kind: ConversationKind,
        body: Value,
        reply_to: Option<String>,
        mentions: Vec<i64>,
    ) -> Result<SendReceipt>;

    async fn pull(
        &self,
        conv_id: i64,
        caller_id: i64,
        since_seq: i64,
        limit: i64,
    ) -> Result<PulledMessages>;

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: &str,
        owner_id: i64,
        member_ids: Vec<i64>,
    ) -> Result<i64>;

    async fn get_conversation(
        &self,
        conv_id: i64,
    ) -> Result<(Conversation, Vec<ConversationMember>)>;

    async fn update_read_seq(&self, conv_id: i64, user_id: i64, seq: i64) -> Result<()>;
}

pub struct MessageService {
    repo: Arc<dyn MessageRepository>,
    fanout: Option<Arc<Fanout>>,
}

impl MessageService {
    pub fn new(repo: Arc<dyn MessageRepository>) -> Self {
        Self { repo, fanout: None }
    }

    pub fn with_fanout(mut self, fanout: Arc<Fanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    fn allocate_msg_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl MessageApi for MessageService {
    async fn send(
        &self,
        conv_id: i64,
        sender_id: i64,
        kind: ConversationKind,
        body: Value,
        reply_to: Option<String>,
        mentions: Vec<i64>,
    ) -> Result<SendReceipt> {
        let actual_kind = self.repo.conversation_kind(conv_id).await?;
        if kind != actual_kind {
            return Err(ImError::InvalidArgument(format!(
                "conv_kind mismatch: conversation {conv_id} is {actual_kind}"
            )));
        }

        let role = self
            .repo
            .member_role(conv_id, sender_id)
            .await?
            .ok_or_else(|| {
                ImError::PermissionDenied(format!(
                    "user {sender_id} is not a member of conversation {conv_id}"
                ))
            })?;
        if !role.can_send(actual_kind) {
            return Err(ImError::PermissionDenied(format!(
                "role {role} cannot send in {actual_kind} conversation"
            )));
        }

        let msg = NewMessage {
            msg_id: Self::allocate_msg_id(),
            conv_id,
            sender_id,
            kind: actual_kind,
            body,
            reply_to,
            mentions,
        };
        let (seq, created_at) = self.repo.append_message(&msg).await?;

        info!(conv_id, msg_id = %msg.msg_id, seq, sender_id, "message persisted");

        // 扇出与 ACK 解耦，在后台尽力而为
        if let Some(fanout) = &self.fanout {
            let fanout = fanout.clone();
            let msg_id = msg.msg_id.clone();
            tokio::spawn(async move {
                fanout.dispatch(conv_id, &msg_id, seq, sender_id).await;
            });
        }

        Ok(SendReceipt {
            msg_id: msg.msg_id,
            seq,
            created_at: created_at.timestamp(),
        })
    }

    async fn pull(
        &self,
        conv_id: i64,
        caller_id: i64,
        since_seq: i64,
        limit: i64,
    ) -> Result<PulledMessages> {
        if self.repo.member_role(conv_id, caller_id).await?.is_none() {
            return Err(ImError::PermissionDenied(format!(
                "user {caller_id} is not a member of conversation {conv_id}"
            )));
        }

        let limit = if limit <= 0 || limit > MAX_PULL_LIMIT {
            MAX_PULL_LIMIT
        } else {
            limit
        };
        self.repo.pull_messages(conv_id, since_seq, limit).await
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: &str,
        owner_id: i64,
        member_ids: Vec<i64>,
    ) -> Result<i64> {
        // owner 缺席时前插，同时去重
        let mut ids: Vec<i64> = Vec::with_capacity(member_ids.len() + 1);
        if !member_ids.contains(&owner_id) {
            ids.push(owner_id);
        }
        for id in member_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let conv_id = self
            .repo
            .create_conversation(kind, title, owner_id, &ids)
            .await?;
        info!(conv_id, %kind, owner_id, member_count = ids.len(), "conversation created");
        Ok(conv_id)
    }

    async fn get_conversation(
        &self,
        conv_id: i64,
    ) -> Result<(Conversation, Vec<ConversationMember>)> {
        self.repo.get_conversation(conv_id).await
    }

    async fn update_read_seq(&self, conv_id: i64, user_id: i64, seq: i64) -> Result<()> {
        if let Err(err) = self.repo.update_read_seq(conv_id, user_id, seq).await {
            warn!(conv_id, user_id, seq, %err, "failed to update read seq");
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_im_core::MemberRole;
    use ripple_presence::{InMemoryRouteRegistry, RouteRegistry};
    use serde_json::json;
    use std::time::Duration;

    use crate::fanout::GatewayPush;
    use crate::memory::InMemoryMessageRepository;
    use ripple_im_core::protocol::{Frame, FrameKind};

    fn service(repo: Arc<InMemoryMessageRepository>) -> MessageService {
        MessageService::new(repo)
    }

    fn text_body() -> Value {
        json!({"type": "text", "content": "hi"})
    }

    #[tokio::test]
    async fn test_direct_send_then_pull() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo.clone());

        let conv_id = svc
            .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
            .await
            .unwrap();
        assert_eq!(conv_id, 1);

        let receipt = svc
            .send(conv_id, 100, ConversationKind::Direct, text_body(), None, Vec::new())
            .await
            .unwrap();
        assert_eq!(receipt.seq, 1);
        assert!(!receipt.msg_id.is_empty());

        let page = svc.pull(conv_id, 200, 0, 10).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].seq, 1);
        assert_eq!(page.messages[0].msg_id, receipt.msg_id);
        assert_eq!(page.messages[0].body, text_body());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_concurrent_senders_serialize() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = Arc::new(service(repo.clone()));
        let conv_id = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![100, 200])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.send(conv_id, 100, ConversationKind::Group, json!({"t": 1}), None, Vec::new())
                    .await
                    .unwrap()
                    .seq
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let page = svc.pull(conv_id, 100, 0, 10).await.unwrap();
        let pulled: Vec<i64> = page.messages.iter().map(|m| m.seq).collect();
        assert_eq!(pulled, vec![1, 2, 3, 4, 5]);
        assert_eq!(repo.current_seq_of(conv_id).await, Some(5));
    }

    #[tokio::test]
    async fn test_owner_is_inserted_when_omitted() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo);

        let conv_id = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![200, 300])
            .await
            .unwrap();

        let (conversation, members) = svc.get_conversation(conv_id).await.unwrap();
        assert_eq!(conversation.owner_id, 100);

        let owners: Vec<_> = members
            .iter()
            .filter(|m| m.role == MemberRole::Owner)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, 100);
        assert_eq!(members.len(), 3);
    }

    #[tokio::test]
    async fn test_send_permission_policy() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo.clone());

        let group = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![100, 200])
            .await
            .unwrap();
        repo.set_member_role(group, 200, MemberRole::Viewer).await;
        let err = svc
            .send(group, 200, ConversationKind::Group, text_body(), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::PermissionDenied(_)));

        let channel = svc
            .create_conversation(ConversationKind::Channel, "c", 100, vec![100, 200, 300])
            .await
            .unwrap();
        repo.set_member_role(channel, 300, MemberRole::Publisher).await;

        // 普通成员不能在 CHANNEL 发言，publisher 可以
        let err = svc
            .send(channel, 200, ConversationKind::Channel, text_body(), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::PermissionDenied(_)));
        assert!(
            svc.send(channel, 300, ConversationKind::Channel, text_body(), None, Vec::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_send_rejects_non_member_and_unknown_conversation() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo);
        let conv_id = svc
            .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
            .await
            .unwrap();

        let err = svc
            .send(conv_id, 999, ConversationKind::Direct, text_body(), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::PermissionDenied(_)));

        let err = svc
            .send(42, 100, ConversationKind::Direct, text_body(), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_send_rejects_kind_mismatch() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo);
        let conv_id = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![100, 200])
            .await
            .unwrap();

        let err = svc
            .send(conv_id, 100, ConversationKind::Channel, text_body(), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_pull_requires_membership_and_clamps_limit() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo);
        let conv_id = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![100, 200])
            .await
            .unwrap();

        let err = svc.pull(conv_id, 999, 0, 10).await.unwrap_err();
        assert!(matches!(err, ImError::PermissionDenied(_)));

        for _ in 0..101 {
            svc.send(conv_id, 100, ConversationKind::Group, text_body(), None, Vec::new())
                .await
                .unwrap();
        }

        // limit 超过上限与非法值一律按 100 处理
        let page = svc.pull(conv_id, 100, 0, 1000).await.unwrap();
        assert_eq!(page.messages.len(), 100);
        assert!(page.has_more);

        let page = svc.pull(conv_id, 100, 0, 0).await.unwrap();
        assert_eq!(page.messages.len(), 100);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_read_seq_is_monotonic() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo.clone());
        let conv_id = svc
            .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
            .await
            .unwrap();

        svc.update_read_seq(conv_id, 200, 50).await.unwrap();
        svc.update_read_seq(conv_id, 200, 40).await.unwrap();
        assert_eq!(repo.read_seq_of(conv_id, 200).await, Some(50));

        let err = svc.update_read_seq(conv_id, 999, 10).await.unwrap_err();
        assert!(matches!(err, ImError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reply_to_and_mentions_are_stored_verbatim() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let svc = service(repo);
        let conv_id = svc
            .create_conversation(ConversationKind::Group, "g", 100, vec![100, 200])
            .await
            .unwrap();

        svc.send(
            conv_id,
            100,
            ConversationKind::Group,
            text_body(),
            Some("m-0".to_string()),
            vec![200],
        )
        .await
        .unwrap();

        let page = svc.pull(conv_id, 100, 0, 10).await.unwrap();
        assert_eq!(page.messages[0].reply_to.as_deref(), Some("m-0"));
        assert_eq!(page.messages[0].mentions, vec![200]);
    }

    struct ChannelPush {
        tx: tokio::sync::mpsc::UnboundedSender<(String, i64, Frame)>,
    }

    #[async_trait]
    impl GatewayPush for ChannelPush {
        async fn push_notification(
            &self,
            gateway_addr: &str,
            user_id: i64,
            frame: &Frame,
        ) -> Result<usize> {
            let _ = self.tx.send((gateway_addr.to_string(), user_id, frame.clone()));
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_send_triggers_detached_fanout() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let registry = Arc::new(InMemoryRouteRegistry::default());
        registry.register_route(200, "d1", "gw-a:8900").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let fanout = Arc::new(Fanout::new(
            repo.clone(),
            registry,
            Arc::new(ChannelPush { tx }),
            Duration::from_secs(5),
        ));
        let svc = MessageService::new(repo).with_fanout(fanout);

        let conv_id = svc
            .create_conversation(ConversationKind::Direct, "", 100, vec![100, 200])
            .await
            .unwrap();
        let receipt = svc
            .send(conv_id, 100, ConversationKind::Direct, text_body(), None, Vec::new())
            .await
            .unwrap();

        let (addr, user_id, frame) =
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("fan-out should fire")
                .expect("push recorded");
        assert_eq!(addr, "gw-a:8900");
        assert_eq!(user_id, 200);
        assert_eq!(frame.kind, FrameKind::Notification);
        assert_eq!(frame.msg_id.as_deref(), Some(receipt.msg_id.as_str()));
    }
}
