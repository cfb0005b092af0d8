use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::auth::AuthedUser;
use crate::rest::error::ApiError;
use crate::AppContext;

pub async fn list_machines(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let machines = ctx.machines.list(&user.namespace).await?;
    Ok(Json(json!({ "machines": machines })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpawnBody {
    pub directory: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub extra: Value,
}

/// Ask the machine's runner to start a new agent session.
pub async fn spawn_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<SpawnBody>,
) -> Result<Json<Value>, ApiError> {
    if ctx.machines.get(&user.namespace, &id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let params = json!({
        "directory": body.directory,
        "tag": body.tag,
        "extra": body.extra,
    });
    let result = ctx
        .runners
        .call_machine(&user.namespace, &id, "spawn", params)
        .await
        .map_err(|e| ApiError::RunnerUnavailable(e.to_string()))?;
    Ok(Json(json!({ "result": result })))
}

#[derive(Deserialize)]
pub struct PathExistsBody {
    pub path: String,
}

/// Ask the machine's runner whether a filesystem path exists.
pub async fn path_exists(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(body): Json<PathExistsBody>,
) -> Result<Json<Value>, ApiError> {
    if body.path.is_empty() {
        return Err(ApiError::Validation("path must not be empty".into()));
    }
    if ctx.machines.get(&user.namespace, &id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let result = ctx
        .runners
        .call_machine(&user.namespace, &id, "path-exists", json!({ "path": body.path }))
        .await
        .map_err(|e| ApiError::RunnerUnavailable(e.to_string()))?;
    Ok(Json(json!({ "result": result })))
}
