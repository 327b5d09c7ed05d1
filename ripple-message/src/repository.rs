//! 消息存储接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ripple_im_core::{ConversationKind, MemberRole, Result};

use crate::model::{Conversation, ConversationMember, NewMessage, PulledMessages};

/// 消息核心的持久化接口
///
/// `append_message` 必须在一个原子作用域内完成序列递增与消息写入：
/// 并发发送方在该点被线性化，seq 由此获得会话内严格单调且无空洞的
/// 保证。
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 原子地创建会话、序列行（初始为 0）与成员行，任一失败全部回滚
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: &str,
        owner_id: i64,
        member_ids: &[i64],
    ) -> Result<i64>;

    async fn get_conversation(
        &self,
        conv_id: i64,
    ) -> Result<(Conversation, Vec<ConversationMember>)>;

    /// 会话类型；会话不存在时返回 NotFound
    async fn conversation_kind(&self, conv_id: i64) -> Result<ConversationKind>;

    async fn member_role(&self, conv_id: i64, user_id: i64) -> Result<Option<MemberRole>>;

    async fn member_ids(&self, conv_id: i64) -> Result<Vec<i64>>;

    /// 分配下一个 seq 并写入消息，两步共享同一原子作用域
    async fn append_message(&self, msg: &NewMessage) -> Result<(i64, DateTime<Utc>)>;

    /// 返回 seq > since_seq 的消息，按 seq 升序，至多 limit 条
    async fn pull_messages(
        &self,
        conv_id: i64,
        since_seq: i64,
        limit: i64,
    ) -> Result<PulledMessages>;

    /// 单调推进已读游标；seq 不大于现值时静默忽略，成员不存在时返回
    /// NotFound
    async fn update_read_seq(&self, conv_id: i64, user_id: i64, seq: i64) -> Result<()>;
}
