//! 客户端协议帧
//!
//! 网关与客户端之间的双向流以 JSON 帧通信。帧的 `payload` 对核心透明，
//! 仅 CHAT / READ 两类在网关侧解析出类型化视图；解析失败以 ERROR 帧
//! 回传客户端自带的 `msg_id`，便于对端关联。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ImError, Result};
use crate::types::ConversationKind;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Ping,
    Pong,
    Chat,
    Ack,
    Error,
    Typing,
    Read,
    Notification,
    /// 未识别的帧类型，记录后忽略
    #[serde(other)]
    Unknown,
}

/// 双向流上的一帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now().timestamp(),
            msg_id: None,
            error_msg: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Value::Null)
    }

    /// 发送成功的 ACK，`msg_id` 同时置于帧头便于客户端匹配
    pub fn ack(msg_id: &str, seq: i64, created_at: i64) -> Self {
        let mut frame = Self::new(
            FrameKind::Ack,
            json!({
                "msg_id": msg_id,
                "seq": seq,
                "created_at": created_at,
            }),
        );
        frame.msg_id = Some(msg_id.to_string());
        frame
    }

    /// 错误帧；`msg_id` 为客户端在请求帧中携带的标识（如有）
    pub fn error(msg_id: Option<String>, code: &str, message: &str) -> Self {
        let mut frame = Self::new(
            FrameKind::Error,
            json!({
                "code": code,
                "error": message,
            }),
        );
        frame.msg_id = msg_id;
        frame.error_msg = Some(message.to_string());
        frame
    }

    pub fn error_from(msg_id: Option<String>, err: &ImError) -> Self {
        Self::error(msg_id, err.code(), &err.to_string())
    }

    /// 新消息通知，推送到接收方的每个在线设备
    pub fn notification(conv_id: i64, msg_id: &str, seq: i64, sender_id: i64) -> Self {
        let mut frame = Self::new(
            FrameKind::Notification,
            json!({
                "conv_id": conv_id,
                "msg_id": msg_id,
                "seq": seq,
                "sender_id": sender_id,
            }),
        );
        frame.msg_id = Some(msg_id.to_string());
        frame
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| ImError::InvalidArgument(format!("bad frame: {err}")))
    }

    pub fn encode(&self) -> String {
        // Frame 的所有字段均可序列化，此处不会失败
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// CHAT 帧 payload 的类型化视图
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub conv_id: i64,
    pub conv_kind: ConversationKind,
    pub body: Value,
    pub reply_to: Option<String>,
    pub mentions: Vec<i64>,
}

impl ChatPayload {
    pub fn from_value(payload: &Value) -> Result<Self> {
        let conv_id = payload
            .get("conv_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ImError::InvalidArgument("invalid conv_id".into()))?;

        let conv_kind = payload
            .get("conv_kind")
            .and_then(Value::as_str)
            .and_then(ConversationKind::parse)
            .ok_or_else(|| ImError::InvalidArgument("invalid conv_kind".into()))?;

        let body = payload
            .get("body")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| ImError::InvalidArgument("invalid body".into()))?;

        let reply_to = payload
            .get("reply_to")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mentions = payload
            .get("mentions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        Ok(Self {
            conv_id,
            conv_kind,
            body,
            reply_to,
            mentions,
        })
    }
}

/// READ 帧 payload 的类型化视图
#[derive(Debug, Clone, Copy)]
pub struct ReadPayload {
    pub conv_id: i64,
    pub seq: i64,
}

impl ReadPayload {
    pub fn from_value(payload: &Value) -> Result<Self> {
        let conv_id = payload
            .get("conv_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ImError::InvalidArgument("invalid conv_id".into()))?;
        let seq = payload
            .get("seq")
            .and_then(Value::as_i64)
            .ok_or_else(|| ImError::InvalidArgument("invalid seq".into()))?;
        Ok(Self { conv_id, seq })
    }
}
