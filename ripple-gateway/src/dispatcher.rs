//! 帧分发器
//!
//! 按帧类型路由到对应处理逻辑。CHAT 校验失败时以 ERROR 帧回传客户端
//! 自带的 msg_id；READ 直连消息核心推进已读游标；TYPING 目前只刷新
//! 活跃时间，不做扇出。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use ripple_im_core::protocol::{ChatPayload, Frame, FrameKind, ReadPayload};
use ripple_message::MessageApi;

use crate::connection::Connection;

pub struct Dispatcher {
    message: Arc<dyn MessageApi>,
}

impl Dispatcher {
    pub fn new(message: Arc<dyn MessageApi>) -> Self {
        Self { message }
    }

    pub async fn handle_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        match frame.kind {
            FrameKind::Ping => self.handle_ping(conn),
            FrameKind::Chat => self.handle_chat(conn, frame).await,
            FrameKind::Ack => self.handle_ack(conn, &frame),
            FrameKind::Typing => self.handle_typing(conn, &frame),
            FrameKind::Read => self.handle_read(conn, frame).await,
            other => {
                warn!(
                    user_id = conn.user_id,
                    kind = ?other,
                    "unexpected frame kind, ignoring"
                );
            }
        }
    }

    fn handle_ping(&self, conn: &Arc<Connection>) {
        conn.touch();
        conn.try_send(Frame::pong());
        debug!(user_id = conn.user_id, device_id = %conn.device_id, "handled ping");
    }

    async fn handle_chat(&self, conn: &Arc<Connection>, frame: Frame) {
        conn.touch();
        let client_msg_id = frame.msg_id.clone();

        let chat = match ChatPayload::from_value(&frame.payload) {
            Ok(chat) => chat,
            Err(err) => {
                conn.try_send(Frame::error_from(client_msg_id, &err));
                return;
            }
        };

        match self
            .message
            .send(
                chat.conv_id,
                conn.user_id,
                chat.conv_kind,
                chat.body,
                chat.reply_to,
                chat.mentions,
            )
            .await
        {
            Ok(receipt) => {
                conn.try_send(Frame::ack(&receipt.msg_id, receipt.seq, receipt.created_at));
                info!(
                    user_id = conn.user_id,
                    msg_id = %receipt.msg_id,
                    seq = receipt.seq,
                    "message sent"
                );
            }
            Err(err) => {
                error!(user_id = conn.user_id, %err, "failed to send message");
                conn.try_send(Frame::error_from(client_msg_id, &err));
            }
        }
    }

    /// 服务端推送的客户端回执，仅做活跃刷新与记录
    fn handle_ack(&self, conn: &Arc<Connection>, frame: &Frame) {
        conn.touch();
        debug!(
            user_id = conn.user_id,
            msg_id = ?frame.msg_id,
            "received client ack"
        );
    }

    fn handle_typing(&self, conn: &Arc<Connection>, frame: &Frame) {
        conn.touch();
        debug!(
            user_id = conn.user_id,
            conv_id = ?frame.payload.get("conv_id").and_then(serde_json::Value::as_i64),
            "user typing"
        );
    }

    async fn handle_read(&self, conn: &Arc<Connection>, frame: Frame) {
        conn.touch();
        let read = match ReadPayload::from_value(&frame.payload) {
            Ok(read) => read,
            Err(err) => {
                debug!(user_id = conn.user_id, %err, "malformed read receipt, ignoring");
                return;
            }
        };

        if let Err(err) = self
            .message
            .update_read_seq(read.conv_id, conn.user_id, read.seq)
            .await
        {
            // 连接保留，读游标失败不致命
            warn!(
                user_id = conn.user_id,
                conv_id = read.conv_id,
                seq = read.seq,
                %err,
                "failed to advance read marker"
            );
        }
    }
}
