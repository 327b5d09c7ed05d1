//! 消息核心数据模型

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use ripple_im_core::{ConversationKind, MemberRole};

/// 单次拉取的条数上限
pub const MAX_PULL_LIMIT: i64 = 100;

/// 会话，创建后除标题外不可变
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub kind: ConversationKind,
    pub title: String,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
}

/// 会话成员，(conv_id, user_id) 唯一
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMember {
    pub conv_id: i64,
    pub user_id: i64,
    pub role: MemberRole,
    pub muted: bool,
    pub last_read_seq: i64,
    pub joined_at: DateTime<Utc>,
}

/// 已持久化的消息，(conv_id, seq) 唯一
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub msg_id: String,
    pub conv_id: i64,
    pub seq: i64,
    pub sender_id: i64,
    pub kind: ConversationKind,
    /// 应用透明的结构化内容，原样存取
    pub body: Value,
    pub reply_to: Option<String>,
    pub mentions: Vec<i64>,
    pub visibility: String,
    pub created_at: DateTime<Utc>,
}

/// 待写入的消息，seq 与 created_at 由存储层在原子作用域内生成
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub msg_id: String,
    pub conv_id: i64,
    pub sender_id: i64,
    pub kind: ConversationKind,
    pub body: Value,
    pub reply_to: Option<String>,
    pub mentions: Vec<i64>,
}

/// 发送回执
#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub msg_id: String,
    pub seq: i64,
    pub created_at: i64,
}

/// 拉取结果；has_more 通过多取一条探测
#[derive(Debug, Clone, Serialize)]
pub struct PulledMessages {
    pub messages: Vec<Message>,
    pub has_more: bool,
}
