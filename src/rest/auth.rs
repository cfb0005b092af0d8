//! Bearer-token extractors for both HTTP planes.
//!
//! Tokens arrive in the `Authorization: Bearer` header, or — for SSE and
//! browser WebSocket clients that cannot set headers — in a `token` query
//! parameter.

use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use crate::auth::{authenticate, Principal, PrincipalKind};
use crate::AppContext;

use super::error::ApiError;

/// Authenticated interactive client.
pub struct AuthedUser(pub Principal);

/// Authenticated CLI runner.
pub struct AuthedRunner(pub Principal);

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(header) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    parts.uri.query().and_then(|query| {
        query
            .split('&')
            .find_map(|kv| kv.strip_prefix("token=").map(|t| t.to_string()))
    })
}

async fn principal_from_parts(
    parts: &Parts,
    ctx: &Arc<AppContext>,
) -> Result<Principal, ApiError> {
    let Some(token) = token_from_parts(parts) else {
        return Err(ApiError::Unauthorized);
    };
    match authenticate(&ctx.storage, &token).await? {
        Some(principal) => Ok(principal),
        None => Err(ApiError::Unauthorized),
    }
}

impl FromRequestParts<Arc<AppContext>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let principal = principal_from_parts(parts, state).await?;
        match principal.kind {
            PrincipalKind::User => Ok(AuthedUser(principal)),
            PrincipalKind::Runner => Err(ApiError::AccessDenied),
        }
    }
}

impl FromRequestParts<Arc<AppContext>> for AuthedRunner {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let principal = principal_from_parts(parts, state).await?;
        match principal.kind {
            PrincipalKind::Runner => Ok(AuthedRunner(principal)),
            PrincipalKind::User => Err(ApiError::AccessDenied),
        }
    }
}
