//! 接入鉴权
//!
//! 令牌对本系统不透明，校验归属 IdentityService 协作方；`JwtIdentity`
//! 是其默认实现（HS256）。校验通过后绑定 user_id 与 device_id。

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use ripple_im_core::{ImError, Result};

/// 校验通过的身份
#[derive(Debug, Clone)]
pub struct AuthClaims {
    pub user_id: i64,
    pub device_id: String,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// 校验令牌并提取 (user_id, device_id)；接入时调用一次
    async fn validate_token(&self, token: &str) -> Result<AuthClaims>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    user_id: i64,
    device_id: String,
    exp: i64,
}

pub struct JwtIdentity {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// 签发令牌；供开发环境与测试使用，生产签发归 IdentityService
    pub fn issue_token(&self, user_id: i64, device_id: &str, ttl_secs: i64) -> Result<String> {
        let claims = TokenClaims {
            user_id,
            device_id: device_id.to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ImError::internal("sign token", err))
    }
}

#[async_trait]
impl IdentityClient for JwtIdentity {
    async fn validate_token(&self, token: &str) -> Result<AuthClaims> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| ImError::Unauthenticated(format!("token validation failed: {err}")))?;
        Ok(AuthClaims {
            user_id: data.claims.user_id,
            device_id: data.claims.device_id,
        })
    }
}

/// 从 `Authorization: Bearer <token>` 头中取出令牌
pub fn bearer_token(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| raw.strip_prefix("Bearer "))
}
