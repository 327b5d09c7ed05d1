//! 一元 HTTP 接口
//!
//! 长连接之外的恢复与管理通道：多会话消息同步（drop-on-full 的兜底
//! 路径）、会话创建与查询，以及跨网关的内部推送端点。除内部端点外
//! 均要求 Bearer 令牌。

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use ripple_im_core::{ImError, Result};
use ripple_message::MessageApi;
use ripple_message::model::{Conversation, ConversationMember, Message};

use crate::identity::{AuthClaims, IdentityClient, bearer_token};
use crate::push::{PushRequest, PushResponse};
use crate::server::GatewayState;

fn status_of(err: &ImError) -> StatusCode {
    match err {
        ImError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        ImError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ImError::NotFound(_) => StatusCode::NOT_FOUND,
        ImError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ImError::TransientBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
        ImError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &ImError) -> Response {
    (
        status_of(err),
        Json(json!({"code": err.code(), "error": err.to_string()})),
    )
        .into_response()
}

pub(crate) async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<AuthClaims> {
    let token = bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )
    .ok_or_else(|| ImError::Unauthenticated("missing or invalid authorization header".into()))?;
    state.identity.validate_token(token).await
}

#[derive(Debug, Deserialize)]
pub struct ConvSync {
    pub conv_id: i64,
    #[serde(default)]
    pub since_seq: i64,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub conversations: Vec<ConvSync>,
}

#[derive(Debug, Serialize)]
pub struct ConvMessages {
    pub conv_id: i64,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub conv_messages: Vec<ConvMessages>,
}

/// 多会话消息同步，逐会话拉取；单个会话失败不拖垮整体
pub async fn sync_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(err) => return error_response(&err),
    };

    let mut conv_messages = Vec::with_capacity(request.conversations.len());
    for sync in request.conversations {
        match state
            .message
            .pull(sync.conv_id, claims.user_id, sync.since_seq, 100)
            .await
        {
            Ok(page) => conv_messages.push(ConvMessages {
                conv_id: sync.conv_id,
                messages: page.messages,
                has_more: page.has_more,
            }),
            Err(err) => {
                warn!(
                    user_id = claims.user_id,
                    conv_id = sync.conv_id,
                    %err,
                    "failed to pull messages"
                );
            }
        }
    }

    Json(SyncResponse { conv_messages }).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateConversationResponse {
    pub conv_id: i64,
}

pub async fn create_conversation_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<CreateConversationRequest>,
) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(err) => return error_response(&err),
    };

    // 未知会话类型在这里被拒绝
    let Some(kind) = ripple_im_core::ConversationKind::parse(&request.kind) else {
        return error_response(&ImError::InvalidArgument(format!(
            "invalid conversation kind: {}",
            request.kind
        )));
    };

    match state
        .message
        .create_conversation(kind, &request.title, claims.user_id, request.member_ids)
        .await
    {
        Ok(conv_id) => Json(CreateConversationResponse { conv_id }).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
    pub members: Vec<ConversationMember>,
}

pub async fn get_conversation_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(conv_id): Path<i64>,
) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(err) => return error_response(&err),
    };

    match state.message.get_conversation(conv_id).await {
        Ok((conversation, members)) => {
            if !members.iter().any(|m| m.user_id == claims.user_id) {
                return error_response(&ImError::PermissionDenied(format!(
                    "user {} is not a member of conversation {conv_id}",
                    claims.user_id
                )));
            }
            Json(ConversationResponse {
                conversation,
                members,
            })
            .into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// 对等网关的内部推送端点，把通知帧广播给本网关上该用户的全部连接
pub async fn push_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<PushRequest>,
) -> Json<PushResponse> {
    let delivered = state
        .manager
        .broadcast_to_user(request.user_id, &request.frame)
        .await;
    Json(PushResponse { delivered })
}

pub async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": state.manager.total_connections().await,
    }))
}
