//! PostgreSQL 消息存储实现
//!
//! 表结构见 `schema.sql`。seq 分配使用行锁自增：
//! `UPDATE conversation_seq ... RETURNING` 与消息 INSERT 在同一事务中，
//! 多实例并发下仍满足严格单调无空洞。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use async_trait::async_trait;
use ripple_im_core::{ConversationKind, ImError, MemberRole, Result};

use crate::model::{Conversation, ConversationMember, NewMessage, PulledMessages};
use crate::repository::MessageRepository;

pub struct PgMessageRepository {
    pool: Arc<PgPool>,
}

impl PgMessageRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// 建立连接池
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|err| ImError::backend("connect to postgres", err))?;
        Ok(Self::new(Arc::new(pool)))
    }

    fn decode_message(row: &PgRow) -> Result<crate::model::Message> {
        let kind_raw: String = row
            .try_get("kind")
            .map_err(|err| ImError::internal("decode message kind", err))?;
        let kind = ConversationKind::parse(&kind_raw)
            .ok_or_else(|| ImError::Internal(format!("unknown conversation kind: {kind_raw}")))?;

        Ok(crate::model::Message {
            msg_id: row
                .try_get("msg_id")
                .map_err(|err| ImError::internal("decode msg_id", err))?,
            conv_id: row
                .try_get("conv_id")
                .map_err(|err| ImError::internal("decode conv_id", err))?,
            seq: row
                .try_get("seq")
                .map_err(|err| ImError::internal("decode seq", err))?,
            sender_id: row
                .try_get("sender_id")
                .map_err(|err| ImError::internal("decode sender_id", err))?,
            kind,
            body: row
                .try_get("body")
                .map_err(|err| ImError::internal("decode body", err))?,
            reply_to: row
                .try_get("reply_to")
                .map_err(|err| ImError::internal("decode reply_to", err))?,
            mentions: row
                .try_get("mentions")
                .map_err(|err| ImError::internal("decode mentions", err))?,
            visibility: row
                .try_get("visibility")
                .map_err(|err| ImError::internal("decode visibility", err))?,
            created_at: row
                .try_get("created_at")
                .map_err(|err| ImError::internal("decode created_at", err))?,
        })
    }

    fn decode_member(row: &PgRow) -> Result<ConversationMember> {
        let role_raw: String = row
            .try_get("role")
            .map_err(|err| ImError::internal("decode member role", err))?;
        let role = MemberRole::parse(&role_raw)
            .ok_or_else(|| ImError::Internal(format!("unknown member role: {role_raw}")))?;

        Ok(ConversationMember {
            conv_id: row
                .try_get("conv_id")
                .map_err(|err| ImError::internal("decode conv_id", err))?,
            user_id: row
                .try_get("user_id")
                .map_err(|err| ImError::internal("decode user_id", err))?,
            role,
            muted: row
                .try_get("muted")
                .map_err(|err| ImError::internal("decode muted", err))?,
            last_read_seq: row
                .try_get("last_read_seq")
                .map_err(|err| ImError::internal("decode last_read_seq", err))?,
            joined_at: row
                .try_get("joined_at")
                .map_err(|err| ImError::internal("decode joined_at", err))?,
        })
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        title: &str,
        owner_id: i64,
        member_ids: &[i64],
    ) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| ImError::backend("begin transaction", err))?;

        let conv_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO conversations (kind, title, owner_id, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(title)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| ImError::backend("create conversation", err))?;

        sqlx::query(
            r#"
            INSERT INTO conversation_seq (conv_id, current_seq)
            VALUES ($1, 0)
            "#,
        )
        .bind(conv_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| ImError::backend("initialize conversation seq", err))?;

        for user_id in member_ids {
            let role = if *user_id == owner_id {
                MemberRole::Owner
            } else {
                MemberRole::Member
            };
            sqlx::query(
                r#"
                INSERT INTO conversation_members
                    (conv_id, user_id, role, muted, last_read_seq, joined_at)
                VALUES ($1, $2, $3, false, 0, NOW())
                "#,
            )
            .bind(conv_id)
            .bind(user_id)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|err| ImError::backend("add conversation member", err))?;
        }

        tx.commit()
            .await
            .map_err(|err| ImError::backend("commit conversation", err))?;

        Ok(conv_id)
    }

    async fn get_conversation(
        &self,
        conv_id: i64,
    ) -> Result<(Conversation, Vec<ConversationMember>)> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, title, owner_id, created_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(conv_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| ImError::backend("load conversation", err))?
        .ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))?;

        let kind_raw: String = row
            .try_get("kind")
            .map_err(|err| ImError::internal("decode conversation kind", err))?;
        let conversation = Conversation {
            id: row
                .try_get("id")
                .map_err(|err| ImError::internal("decode id", err))?,
            kind: ConversationKind::parse(&kind_raw).ok_or_else(|| {
                ImError::Internal(format!("unknown conversation kind: {kind_raw}"))
            })?,
            title: row
                .try_get("title")
                .map_err(|err| ImError::internal("decode title", err))?,
            owner_id: row
                .try_get("owner_id")
                .map_err(|err| ImError::internal("decode owner_id", err))?,
            created_at: row
                .try_get("created_at")
                .map_err(|err| ImError::internal("decode created_at", err))?,
        };

        let member_rows = sqlx::query(
            r#"
            SELECT conv_id, user_id, role, muted, last_read_seq, joined_at
            FROM conversation_members
            WHERE conv_id = $1
            ORDER BY joined_at ASC
            "#,
        )
        .bind(conv_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|err| ImError::backend("load conversation members", err))?;

        let members = member_rows
            .iter()
            .map(Self::decode_member)
            .collect::<Result<Vec<_>>>()?;

        Ok((conversation, members))
    }

    async fn conversation_kind(&self, conv_id: i64) -> Result<ConversationKind> {
        let kind_raw: Option<String> =
            sqlx::query_scalar("SELECT kind FROM conversations WHERE id = $1")
                .bind(conv_id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|err| ImError::backend("load conversation kind", err))?;

        let kind_raw =
            kind_raw.ok_or_else(|| ImError::NotFound(format!("conversation {conv_id}")))?;
        ConversationKind::parse(&kind_raw)
            .ok_or_else(|| ImError::Internal(format!("unknown conversation kind: {kind_raw}")))
    }

    async fn member_role(&self, conv_id: i64, user_id: i64) -> Result<Option<MemberRole>> {
        let role_raw: Option<String> = sqlx::query_scalar(
            "SELECT role FROM conversation_members WHERE conv_id = $1 AND user_id = $2",
        )
        .bind(conv_id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| ImError::backend("load member role", err))?;

        match role_raw {
            Some(raw) => MemberRole::parse(&raw)
                .map(Some)
                .ok_or_else(|| ImError::Internal(format!("unknown member role: {raw}"))),
            None => Ok(None),
        }
    }

    async fn member_ids(&self, conv_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT user_id FROM conversation_members WHERE conv_id = $1")
            .bind(conv_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|err| ImError::backend("load member ids", err))
    }

    async fn append_message(&self, msg: &NewMessage) -> Result<(i64, DateTime<Utc>)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| ImError::backend("begin transaction", err))?;

        // 行锁下自增，并发发送方在此线性化
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE conversation_seq
            SET current_seq = current_seq + 1
            WHERE conv_id = $1
            RETURNING current_seq
            "#,
        )
        .bind(msg.conv_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| ImError::backend("allocate seq", err))?;

        let seq = seq.ok_or_else(|| ImError::NotFound(format!("conversation {}", msg.conv_id)))?;

        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO messages
                (msg_id, conv_id, seq, sender_id, kind, body, reply_to, mentions,
                 visibility, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'normal', NOW())
            RETURNING created_at
            "#,
        )
        .bind(&msg.msg_id)
        .bind(msg.conv_id)
        .bind(seq)
        .bind(msg.sender_id)
        .bind(msg.kind.as_str())
        .bind(&msg.body)
        .bind(&msg.reply_to)
        .bind(&msg.mentions)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| ImError::backend("store message", err))?;

        tx.commit()
            .await
            .map_err(|err| ImError::backend("commit message", err))?;

        Ok((seq, created_at))
    }

    async fn pull_messages(
        &self,
        conv_id: i64,
        since_seq: i64,
        limit: i64,
    ) -> Result<PulledMessages> {
        // 多取一条用于 has_more 探测
        let rows = sqlx::query(
            r#"
            SELECT msg_id, conv_id, seq, sender_id, kind, body, reply_to, mentions,
                   visibility, created_at
            FROM messages
            WHERE conv_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(conv_id)
        .bind(since_seq)
        .bind(limit + 1)
        .fetch_all(&*self.pool)
        .await
        .map_err(|err| ImError::backend("pull messages", err))?;

        let mut messages = rows
            .iter()
            .map(Self::decode_message)
            .collect::<Result<Vec<_>>>()?;

        let has_more = messages.len() as i64 > limit;
        if has_more {
            messages.truncate(limit as usize);
        }

        Ok(PulledMessages { messages, has_more })
    }

    async fn update_read_seq(&self, conv_id: i64, user_id: i64, seq: i64) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE conversation_members
            SET last_read_seq = $1
            WHERE conv_id = $2 AND user_id = $3 AND last_read_seq < $1
            "#,
        )
        .bind(seq)
        .bind(conv_id)
        .bind(user_id)
        .execute(&*self.pool)
        .await
        .map_err(|err| ImError::backend("update read seq", err))?;

        if updated.rows_affected() == 0 {
            // 区分"未推进"（静默成功）与"成员不存在"（错误）
            let exists: Option<i32> = sqlx::query_scalar(
                "SELECT 1 FROM conversation_members WHERE conv_id = $1 AND user_id = $2",
            )
            .bind(conv_id)
            .bind(user_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|err| ImError::backend("check membership", err))?;
            if exists.is_none() {
                return Err(ImError::NotFound(format!(
                    "user {user_id} is not a member of conversation {conv_id}"
                )));
            }
        }

        Ok(())
    }
}
