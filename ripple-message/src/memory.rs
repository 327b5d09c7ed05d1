//! 内存消息存储，用于单测与单机开发
//!
//! 单把写锁即是"原子作用域"：seq 递增与消息追加在同一临界区内完成。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use async_trait::async_trait;
use ripple_im_core::{ConversationKind, ImError, MemberRole, Result};

use crate::model::{Conversation, ConversationMember, Message, NewMessage, PulledMessages};
use crate::repository::MessageRepository;

struct ConvEntry {
    conversation: Conversation,
    members: Vec<ConversationMember>,
    current_seq: i64,
    messages: Vec<Message>,
}

#[derive(Default)]
struct State {
    next_conv_id: i64,
    convs: HashMap<i64, ConvEntry>,
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    state: RwLock<State>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：读取某成员当前的已读游标
    pub async fn read_seq_of(&self, conv_id: i64, user_id: i64) -> Option<i64> {
        let state = self.state.read().await;
        state.convs.get(&conv_id).and_then(|entry| {
            entry
                .members
                .iter()
                .find(|m| m.user_id == user_id)
                .map(|m| m.last_read_seq)
        })
    }

    /// 测试辅助：当前序列值，用于校验 current_seq == max(seq)
    pub async fn current_seq_of(&self, conv_id: i64) -> Option<i64> {
        let state = self.state.read().await;
        state.convs.get(&conv_id).map(|entry| entry.current_seq)
    }

    /// 测试辅助：调整成员角色
    pub async fn set_member_role(&self, conv_id: i64, user_id: i64, role: MemberRole) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.convs.get_mut(&conv_id) {
            if let Some(member) = entry.members.iter_mut().find(|m| m.user_id == user_id) {
                member.role = role;
            }
        }
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: &str,
        owner_id: i64,
        member_ids: &[i64],
    ) -> Result<i64> {
        let mut state = self.state.write().await;
        state.next_conv_id += 1;
        let conv_id = state.next_conv_id;
        let now = Utc::now();

        let members = member_ids
            .iter()
            .map(|user_id| ConversationMember {
                conv_id,
                user_id: *user_id,
                role: if *user_id == owner_id {
                    MemberRole::Owner
                } else {
                    MemberRole::Member
                },
                muted: false,
                last_read_seq: 0,
                joined_at: now,
            })
            .collect();

        state.convs.insert(
            conv_id,
            ConvEntry {
                conversation: Conversation {
                    id: conv_id,
                    kind,
                    title: title.to_string(),
                    owner_id,
                    created_at: now,
                },
                members,
                current_seq: 0,
                messages: Vec::new(),
            },
        );

        Ok(conv_id)
    }

    async fn get_conversation(
        &self,
        conv_id: i64,
    ) -> Result<(Conversation, Vec<ConversationMember>)> {
        let state = self.state.read().await;
        let entry = state
            .convs
            .get(&conv_id)
            .ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))?;
        Ok((entry.conversation.clone(), entry.members.clone()))
    }

    async fn conversation_kind(&self, conv_id: i64) -> Result<ConversationKind> {
        let state = self.state.read().await;
        state
            .convs
            .get(&conv_id)
            .map(|entry| entry.conversation.kind)
            .ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))
    }

    async fn member_role(&self, conv_id: i64, user_id: i64) -> Result<Option<MemberRole>> {
        let state = self.state.read().await;
        Ok(state.convs.get(&conv_id).and_then(|entry| {
            entry
                .members
                .iter()
                .find(|m| m.user_id == user_id)
                .map(|m| m.role)
        }))
    }

    async fn member_ids(&self, conv_id: i64) -> Result<Vec<i64>> {
        let state = self.state.read().await;
        Ok(state
            .convs
            .get(&conv_id)
            .map(|entry| entry.members.iter().map(|m| m.user_id).collect())
            .unwrap_or_default())
    }

    async fn append_message(&self, msg: &NewMessage) -> Result<(i64, DateTime<Utc>)> {
        let mut state = self.state.write().await;
        let entry = state
            .convs
            .get_mut(&msg.conv_id)
            .ok_or_else(|| ImError::NotFound(format!("conversation {}", msg.conv_id)))?;

        entry.current_seq += 1;
        let seq = entry.current_seq;
        let created_at = Utc::now();
        entry.messages.push(Message {
            msg_id: msg.msg_id.clone(),
            conv_id: msg.conv_id,
            seq,
            sender_id: msg.sender_id,
            kind: msg.kind,
            body: msg.body.clone(),
            reply_to: msg.reply_to.clone(),
            mentions: msg.mentions.clone(),
            visibility: "normal".to_string(),
            created_at,
        });

        Ok((seq, created_at))
    }

    async fn pull_messages(
        &self,
        conv_id: i64,
        since_seq: i64,
        limit: i64,
    ) -> Result<PulledMessages> {
        let state = self.state.read().await;
        let entry = state
            .convs
            .get(&conv_id)
            .ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))?;

        let mut messages: Vec<Message> = entry
            .messages
            .iter()
            .filter(|m| m.seq > since_seq)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);

        let has_more = messages.len() as i64 > limit;
        messages.truncate(limit as usize);

        Ok(PulledMessages { messages, has_more })
    }

    async fn update_read_seq(&self, conv_id: i64, user_id: i64, seq: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .convs
            .get_mut(&conv_id)
            .ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))?;
        let member = entry
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or_else(|| {
                ImError::NotFound(format!(
                    "user {user_id} is not a member of conversation {conv_id}"
                ))
            })?;

        if seq > member.last_read_seq {
            member.last_read_seq = seq;
        }
        Ok(())
    }
}
