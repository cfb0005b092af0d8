//! Per-user surface: push subscriptions, preferences, subscription visibility.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::events::SyncEvent;
use crate::fanout::Visibility;
use crate::rest::auth::AuthedUser;
use crate::rest::error::ApiError;
use crate::AppContext;

/// Preference key whose updates are fanned out to the user's devices.
const SESSION_SORT_KEY: &str = "session-sort";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscribeBody {
    pub endpoint: String,
    #[serde(default)]
    pub keys: Value,
}

pub async fn push_subscribe(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<PushSubscribeBody>,
) -> Result<Json<Value>, ApiError> {
    if body.endpoint.is_empty() {
        return Err(ApiError::Validation("endpoint must not be empty".into()));
    }
    let row = ctx
        .storage
        .upsert_push_subscription(&user.namespace, &user.user_id, &body.endpoint, &body.keys)
        .await?;
    Ok(Json(json!({ "subscription": {
        "id": row.id,
        "endpoint": row.endpoint,
        "createdAt": row.created_at,
    }})))
}

pub async fn push_unsubscribe(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.storage.delete_push_subscription(&user.user_id, &id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

pub async fn push_subscriptions(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let rows = ctx.storage.list_push_subscriptions(&user.user_id).await?;
    let subscriptions: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "endpoint": row.endpoint,
                "createdAt": row.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

pub async fn get_preference(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = ctx.storage.get_user_preference(&user.user_id, &key).await?;
    let value = row
        .map(|r| serde_json::from_str(&r.value).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    Ok(Json(json!({ "key": key, "value": value })))
}

#[derive(Deserialize)]
pub struct PreferenceBody {
    pub value: Value,
}

pub async fn put_preference(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(key): Path<String>,
    Json(body): Json<PreferenceBody>,
) -> Result<Json<Value>, ApiError> {
    ctx.storage
        .set_user_preference(&user.user_id, &key, &body.value)
        .await?;
    if key == SESSION_SORT_KEY {
        ctx.publisher.emit(SyncEvent::SessionSortPreferenceUpdated {
            user_id: user.user_id.clone(),
            value: body.value.clone(),
        });
    }
    Ok(Json(json!({ "key": key, "value": body.value })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityBody {
    pub subscription_id: String,
    pub visibility: Visibility,
}

/// Toggle whether a live subscription receives toasts.
pub async fn set_visibility(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(_user): AuthedUser,
    Json(body): Json<VisibilityBody>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.fanout.set_visibility(&body.subscription_id, body.visibility).await {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "updated": true })))
}
