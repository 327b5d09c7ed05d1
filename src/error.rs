//! Ripple IM 错误类型
//!
//! 统一的业务错误分类，各服务共用。后端（存储/注册表）故障一律归入
//! `TransientBackend`，由调用方决定是否重试；网关推送路径只记录日志，
//! 不向发送方回传。

use std::fmt::Display;

pub type Result<T> = std::result::Result<T, ImError>;

/// 统一业务错误
#[derive(Debug, thiserror::Error)]
pub enum ImError {
    /// 缺失、非法或过期的凭证，连接会被拒绝
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// 请求内容不合法（帧字段缺失、未知会话类型等），连接保留
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 存储或注册表调用失败，调用方可重试
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ImError {
    /// 将基础设施错误包装为可重试的后端错误，并附加上下文
    pub fn backend(context: &str, err: impl Display) -> Self {
        Self::TransientBackend(format!("{context}: {err}"))
    }

    pub fn internal(context: &str, err: impl Display) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }

    /// 调用方是否应当重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }

    /// 面向客户端 ERROR 帧的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::TransientBackend(_) => "TRANSIENT_BACKEND",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_wraps_context() {
        let err = ImError::backend("failed to store route", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("failed to store route"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_only_backend_errors_are_retryable() {
        assert!(!ImError::NotFound("conversation 1".into()).is_retryable());
        assert!(!ImError::PermissionDenied("viewer".into()).is_retryable());
        assert!(ImError::TransientBackend("timeout".into()).is_retryable());
    }
}
