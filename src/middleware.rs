//! Request identity extraction
//!
//! Callers identify themselves with an `x-user-id` header set by the edge
//! proxy. Rule overrides are scoped per user id; anything else only needs
//! the id for attribution.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

/// Caller identity taken from the `x-user-id` header
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(AppError::Unauthorized)?;

        Ok(CallerIdentity {
            user_id: user_id.to_string(),
        })
    }
}
