//! Bearer-token authentication.
//!
//! A token authenticates to exactly one namespace as either an interactive
//! user or a CLI runner. Only SHA-256 digests are persisted; the raw token
//! exists once, on the terminal of whoever ran `hubd token create`.

use anyhow::Result;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::Storage;

/// Principal kinds, matching `users.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    User,
    Runner,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Runner => "runner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(PrincipalKind::User),
            "runner" => Some(PrincipalKind::Runner),
            _ => None,
        }
    }
}

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub namespace: String,
    pub kind: PrincipalKind,
}

/// Lowercase hex SHA-256 of a raw bearer token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Mint a fresh opaque token. Two v4 UUIDs' worth of randomness.
pub fn generate_token() -> String {
    format!(
        "hub_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Resolve a raw bearer token to its principal, if any.
pub async fn authenticate(storage: &Storage, token: &str) -> Result<Option<Principal>> {
    if token.is_empty() {
        return Ok(None);
    }
    let Some(user) = storage.get_user_by_token_hash(&hash_token(token)).await? else {
        return Ok(None);
    };
    let Some(kind) = PrincipalKind::parse(&user.kind) else {
        return Ok(None);
    };
    Ok(Some(Principal {
        user_id: user.id,
        namespace: user.namespace,
        kind,
    }))
}
