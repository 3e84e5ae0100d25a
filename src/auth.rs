use async_trait::async_trait;

use crate::error::AuthError;
use crate::packet::AuthInfo;

pub const DEFAULT_TOKEN: &str = "123";

/// Decides whether an AUTH request's credentials are acceptable.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, uid: i64, token: &str) -> bool;
}

/// Accepts any uid presenting one shared token.
pub struct StaticTokenValidator {
    token: String,
}

impl StaticTokenValidator {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Default for StaticTokenValidator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN)
    }
}

#[async_trait]
impl CredentialValidator for StaticTokenValidator {
    async fn validate(&self, _uid: i64, token: &str) -> bool {
        token == self.token
    }
}

/// Parses an AUTH payload and runs it past `validator`.
pub async fn check_credentials(
    validator: &dyn CredentialValidator,
    payload: &[u8],
) -> Result<AuthInfo, AuthError> {
    let info: AuthInfo = serde_json::from_slice(payload).map_err(|_| AuthError::Malformed)?;
    if info.uid == 0 || info.token.is_empty() {
        return Err(AuthError::Malformed);
    }
    if !validator.validate(info.uid, &info.token).await {
        return Err(AuthError::Rejected(info.uid));
    }
    Ok(info)
}
