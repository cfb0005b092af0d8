use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::permissions::{Decision, ResponseExtras};
use crate::rest::auth::AuthedUser;
use crate::rest::error::ApiError;
use crate::session::{DeleteOutcome, SessionView};
use crate::storage::VersionedUpdate;
use crate::transport::HubFrame;
use crate::AppContext;

/// Resolve a session id inside the caller's namespace.
///
/// A foreign-namespace id is a 403 (`access-denied`), never a silent 404;
/// a namespace must not be able to probe another's ids.
pub async fn resolve_session(
    ctx: &Arc<AppContext>,
    namespace: &str,
    id: &str,
) -> Result<SessionView, ApiError> {
    let Some(row) = ctx.storage.get_session_raw(id).await? else {
        return Err(ApiError::NotFound);
    };
    if row.namespace != namespace {
        return Err(ApiError::AccessDenied);
    }
    match ctx.sessions.get(namespace, id).await? {
        Some(view) => Ok(view),
        None => Err(ApiError::NotFound),
    }
}

pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let sessions = ctx.sessions.list(&user.namespace).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = resolve_session(&ctx, &user.namespace, &id).await?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameBody {
    pub name: String,
    pub expected_version: i64,
}

pub async fn rename_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    resolve_session(&ctx, &user.namespace, &id).await?;
    match ctx
        .sessions
        .rename(&user.namespace, &id, &body.name, body.expected_version)
        .await?
    {
        VersionedUpdate::Updated(session) => Ok(Json(json!({ "session": session }))),
        VersionedUpdate::VersionMismatch(latest) => {
            Err(ApiError::VersionMismatch(json!({ "session": latest })))
        }
        VersionedUpdate::NotFound => Err(ApiError::NotFound),
    }
}

pub async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &user.namespace, &id).await?;
    match ctx.sessions.delete(&user.namespace, &id).await? {
        DeleteOutcome::Deleted => Ok(Json(json!({ "deleted": true }))),
        DeleteOutcome::ActiveRefused => Err(ApiError::Validation(
            "session is active; end it before deleting".into(),
        )),
        DeleteOutcome::NotFound => Err(ApiError::NotFound),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AbortBody {
    pub reason: Option<String>,
}

/// Abort the agent's in-flight prompt and cancel every pending permission
/// request in the session.
pub async fn abort_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<AbortBody>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &user.namespace, &id).await?;
    let reason = body.reason.unwrap_or_else(|| "user aborted".to_string());

    let delivered = ctx
        .runners
        .cancel_prompt(&user.namespace, &id, &reason)
        .await?;
    let cancelled = ctx
        .broker
        .cancel_all(&user.namespace, &id, &reason, Some(Decision::Abort))
        .await?;
    Ok(Json(json!({ "aborted": delivered, "cancelled": cancelled })))
}

#[derive(Deserialize)]
pub struct PermissionModeBody {
    pub mode: String,
}

pub async fn set_permission_mode(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<PermissionModeBody>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &user.namespace, &id).await?;
    let session = apply_session_config(&ctx, &user.namespace, &id, Some(&body.mode), None).await?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Deserialize)]
pub struct ModelModeBody {
    pub model: String,
}

pub async fn set_model_mode(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<ModelModeBody>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &user.namespace, &id).await?;
    let session = apply_session_config(&ctx, &user.namespace, &id, None, Some(&body.model)).await?;
    Ok(Json(json!({ "session": session })))
}

/// Update the cached modes and forward the change to the live runner link.
async fn apply_session_config(
    ctx: &Arc<AppContext>,
    namespace: &str,
    id: &str,
    permission_mode: Option<&str>,
    model_mode: Option<&str>,
) -> Result<SessionView, ApiError> {
    let Some(session) = ctx
        .sessions
        .apply_config(namespace, id, permission_mode, model_mode)
        .await?
    else {
        return Err(ApiError::NotFound);
    };
    ctx.runners
        .send_to_session(
            namespace,
            id,
            HubFrame::SessionConfig {
                session_id: id.to_string(),
                permission_mode: permission_mode.map(str::to_string),
                model_mode: model_mode.map(str::to_string),
            },
        )
        .await?;
    Ok(session)
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub before_seq: Option<i64>,
    pub limit: Option<i64>,
}

/// Keep only request records created at or after the oldest returned message.
fn filter_permission_map(map: &Value, cutoff: i64) -> Value {
    match map.as_object() {
        Some(obj) => Value::Object(
            obj.iter()
                .filter(|(_, record)| {
                    record
                        .get("createdAt")
                        .and_then(Value::as_i64)
                        .map(|at| at >= cutoff)
                        .unwrap_or(true)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => Value::Object(Default::default()),
    }
}

pub async fn get_messages(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &user.namespace, &id).await?;
    let page = ctx.messages.page(&id, query.before_seq, query.limit).await?;

    let cutoff = page.messages.first().map(|m| m.created_at).unwrap_or(i64::MIN);
    let (requests, completed) = ctx
        .sessions
        .permission_maps(&user.namespace, &id)
        .await?
        .unwrap_or((Value::Object(Default::default()), Value::Object(Default::default())));

    Ok(Json(json!({
        "messages": page.messages,
        "page": {
            "limit": page.limit,
            "beforeSeq": page.before_seq,
            "nextBeforeSeq": page.next_before_seq,
            "hasMore": page.has_more,
        },
        "permissions": {
            "requests": filter_permission_map(&requests, cutoff),
            "completedRequests": filter_permission_map(&completed, cutoff),
        },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    pub text: String,
    pub local_id: Option<String>,
    pub attachments: Option<Value>,
}

/// Store a user message and hand it to the session's runner.
pub async fn post_message(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<Value>, ApiError> {
    if body.text.is_empty() {
        return Err(ApiError::Validation("text must not be empty".into()));
    }
    resolve_session(&ctx, &user.namespace, &id).await?;

    let mut content = json!({ "role": "user", "text": body.text });
    if let Some(attachments) = body.attachments {
        content["attachments"] = attachments;
    }
    let (message, _created) = ctx
        .messages
        .append(&user.namespace, &id, &content, body.local_id.as_deref())
        .await?;

    ctx.runners
        .send_to_session(
            &user.namespace,
            &id,
            HubFrame::NewMessage {
                session_id: id.clone(),
                message: message.clone(),
            },
        )
        .await?;
    Ok(Json(json!({ "message": message })))
}

// ─── Permission responses ────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponseBody {
    pub decision: Option<Decision>,
    pub mode: Option<String>,
    pub allow_tools: Option<Vec<String>>,
    pub answers: Option<Value>,
    pub reason: Option<String>,
}

pub async fn approve_permission(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path((id, request_id)): Path<(String, String)>,
    Json(body): Json<PermissionResponseBody>,
) -> Result<Json<Value>, ApiError> {
    respond_permission(ctx, user.namespace, id, request_id, body, Decision::Approved).await
}

pub async fn deny_permission(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path((id, request_id)): Path<(String, String)>,
    Json(body): Json<PermissionResponseBody>,
) -> Result<Json<Value>, ApiError> {
    respond_permission(ctx, user.namespace, id, request_id, body, Decision::Denied).await
}

async fn respond_permission(
    ctx: Arc<AppContext>,
    namespace: String,
    session_id: String,
    request_id: String,
    body: PermissionResponseBody,
    default_decision: Decision,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &namespace, &session_id).await?;
    let decision = body.decision.unwrap_or(default_decision);

    let applied = ctx
        .broker
        .respond(
            &namespace,
            &session_id,
            &request_id,
            decision,
            ResponseExtras {
                reason: body.reason,
                allow_tools: body.allow_tools,
                answers: body.answers,
            },
        )
        .await?;

    // An accompanying mode switch ("don't ask again for this session")
    // rides the same request.
    if applied.is_some() {
        if let Some(mode) = &body.mode {
            apply_session_config(&ctx, &namespace, &session_id, Some(mode), None).await?;
        }
    }
    Ok(Json(json!({ "applied": applied.is_some() })))
}
