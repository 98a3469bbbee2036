use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;
use crate::shared::models::UserRole;

/// Caller identity as asserted by the external auth layer. The identity
/// provider in front of this service resolves the session and forwards a
/// stable user id plus role in headers; this service only trusts, never
/// authenticates.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Identity {
    pub fn require_staff(&self) -> Result<(), ApiError> {
        if self.role.is_staff() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ApiError::Unauthorized)?;
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(UserRole::parse)
            .ok_or(ApiError::Unauthorized)?;
        Ok(Identity { user_id, role })
    }
}

/// Partner API key check for the unauthenticated partner submission path.
pub fn verify_partner_key(expected: Option<&str>, provided: Option<&str>) -> Result<(), ApiError> {
    match (expected, provided) {
        (Some(expected), Some(provided)) if expected == provided => Ok(()),
        (None, _) => Err(ApiError::Forbidden),
        _ => Err(ApiError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_key_must_match() {
        assert!(verify_partner_key(Some("k1"), Some("k1")).is_ok());
        assert!(verify_partner_key(Some("k1"), Some("k2")).is_err());
        assert!(verify_partner_key(Some("k1"), None).is_err());
        // No key configured means the partner surface is disabled outright.
        assert!(verify_partner_key(None, Some("k1")).is_err());
    }
}
