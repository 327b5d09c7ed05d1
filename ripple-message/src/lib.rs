//! 消息核心
//!
//! 负责会话生命周期、会话内严格单调的消息序列、消息持久化与已读游标，
//! 以及提交后的异步通知扇出。序列分配与消息写入共享同一个原子作用域，
//! 不存在分配了 seq 却没有消息行的状态，反之亦然。

pub mod fanout;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod repository;
pub mod service;

pub use fanout::{Fanout, GatewayPush};
pub use memory::InMemoryMessageRepository;
pub use model::{
    Conversation, ConversationMember, Message, NewMessage, PulledMessages, SendReceipt,
};
pub use postgres::PgMessageRepository;
pub use repository::MessageRepository;
pub use service::{MessageApi, MessageService};
