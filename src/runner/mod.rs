//! Runner-facing plane (`/cli`).
//!
//! CLI runners register machines and sessions over plain HTTP, then hold a
//! duplex WebSocket on `/cli` for the live traffic: heartbeats, message
//! appends, and permission requests inbound; new user messages, permission
//! decisions, config pushes, prompt cancellation, and correlated RPCs
//! outbound. A runner connection is the concrete [`AgentLink`] behind the
//! registry.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::{any, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::permissions::{PermissionOption, PermissionRequest};
use crate::rest::auth::AuthedRunner;
use crate::rest::error::ApiError;
use crate::rest::routes::sessions::resolve_session;
use crate::session::SessionAlive;
use crate::storage::now_ms;
use crate::transport::{AgentLink, HubFrame};
use crate::AppContext;

// ─── HTTP routes ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertMachineBody {
    id: String,
    #[serde(default = "empty_object")]
    metadata: Value,
    runner_state: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

async fn upsert_machine(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Json(body): Json<UpsertMachineBody>,
) -> Result<Json<Value>, ApiError> {
    if body.id.is_empty() {
        return Err(ApiError::Validation("machine id must not be empty".into()));
    }
    let machine = ctx
        .machines
        .upsert(&runner.namespace, &body.id, &body.metadata, body.runner_state.as_ref())
        .await?;
    Ok(Json(json!({ "machine": machine })))
}

async fn get_machine(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match ctx.machines.get(&runner.namespace, &id).await? {
        Some(machine) => Ok(Json(json!({ "machine": machine }))),
        None => Err(ApiError::NotFound),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    tag: Option<String>,
    #[serde(default = "empty_object")]
    metadata: Value,
    agent_state: Option<Value>,
}

async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, ApiError> {
    let session = ctx
        .sessions
        .get_or_create(
            &runner.namespace,
            body.tag.as_deref(),
            &body.metadata,
            body.agent_state.as_ref(),
        )
        .await?;
    Ok(Json(json!({ "session": session })))
}

async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = resolve_session(&ctx, &runner.namespace, &id).await?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TailQuery {
    after_seq: Option<i64>,
    limit: Option<i64>,
}

async fn tail_messages(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<Value>, ApiError> {
    resolve_session(&ctx, &runner.namespace, &id).await?;
    let messages = ctx
        .messages
        .tail(&id, query.after_seq.unwrap_or(0), query.limit)
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeBody {
    old_session_id: String,
    new_session_id: String,
}

/// Fold a predecessor session into its successor (runner reconnect path).
async fn merge_sessions(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    Json(body): Json<MergeBody>,
) -> Result<Json<Value>, ApiError> {
    if body.old_session_id == body.new_session_id {
        return Err(ApiError::Validation("cannot merge a session into itself".into()));
    }
    match ctx
        .sessions
        .merge(&runner.namespace, &body.old_session_id, &body.new_session_id)
        .await?
    {
        Some(session) => Ok(Json(json!({ "session": session }))),
        None => Err(ApiError::NotFound),
    }
}

// ─── Duplex channel ──────────────────────────────────────────────────────────

/// Inbound frames on the runner socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum RunnerFrame {
    MachineAlive {
        machine_id: String,
        time: i64,
    },
    SessionAlive {
        session_id: String,
        time: i64,
        thinking: Option<bool>,
        permission_mode: Option<String>,
        model_mode: Option<String>,
    },
    SessionEnd {
        session_id: String,
        time: i64,
    },
    Append {
        session_id: String,
        message: AppendMessage,
    },
    PermissionRequest {
        session_id: String,
        id: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
        options: Vec<PermissionOption>,
    },
    RpcResponse {
        id: String,
        #[serde(default)]
        result: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendMessage {
    content: Value,
    local_id: Option<String>,
}

/// Outbound half of a runner connection; what the registry holds.
struct WsLink {
    tx: mpsc::Sender<HubFrame>,
}

#[async_trait]
impl AgentLink for WsLink {
    async fn send(&self, frame: HubFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("runner link closed"))
    }
}

async fn runner_ws(
    State(ctx): State<Arc<AppContext>>,
    AuthedRunner(runner): AuthedRunner,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(ctx, runner, socket))
}

async fn handle_socket(ctx: Arc<AppContext>, runner: Principal, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::channel::<HubFrame>(256);
    let link: Arc<dyn AgentLink> = Arc::new(WsLink { tx });

    // Sessions/machines this connection is currently serving; used to tear
    // down registry entries and cancel pending permissions on disconnect.
    let mut sessions: HashSet<String> = HashSet::new();
    let mut machines: HashSet<String> = HashSet::new();

    info!(namespace = %runner.namespace, "runner connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(err = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: RunnerFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(err = %e, "ignoring malformed runner frame");
                            continue;
                        }
                    };
                    if let Err(e) = handle_frame(
                        &ctx,
                        &runner,
                        &link,
                        &mut sessions,
                        &mut machines,
                        frame,
                    )
                    .await
                    {
                        warn!(namespace = %runner.namespace, err = %e, "runner frame failed");
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(err = %e, "runner socket error");
                    break;
                }
                _ => {}
            },
        }
    }

    // Disconnect: drop registry entries and fail pending permissions so
    // waiting clients observe a terminal state. Liveness flags decay via the
    // normal heartbeat expiry.
    for sid in &sessions {
        ctx.runners.detach_session(&runner.namespace, sid).await;
        if let Err(e) = ctx
            .broker
            .cancel_all(&runner.namespace, sid, "agent disconnected", None)
            .await
        {
            warn!(sid = %sid, err = %e, "failed to cancel pending permissions on disconnect");
        }
    }
    for mid in &machines {
        ctx.runners.detach_machine(&runner.namespace, mid).await;
    }
    info!(namespace = %runner.namespace, "runner disconnected");
}

async fn handle_frame(
    ctx: &Arc<AppContext>,
    runner: &Principal,
    link: &Arc<dyn AgentLink>,
    sessions: &mut HashSet<String>,
    machines: &mut HashSet<String>,
    frame: RunnerFrame,
) -> Result<()> {
    match frame {
        RunnerFrame::MachineAlive { machine_id, time } => {
            if machines.insert(machine_id.clone()) {
                ctx.runners
                    .attach_machine(&runner.namespace, &machine_id, link.clone())
                    .await;
            }
            ctx.machines
                .handle_alive(&runner.namespace, &machine_id, time)
                .await
        }
        RunnerFrame::SessionAlive {
            session_id,
            time,
            thinking,
            permission_mode,
            model_mode,
        } => {
            attach_session(ctx, runner, link, sessions, &session_id).await;
            ctx.sessions
                .handle_alive(
                    &runner.namespace,
                    SessionAlive {
                        session_id,
                        time,
                        thinking,
                        permission_mode,
                        model_mode,
                    },
                )
                .await
        }
        RunnerFrame::SessionEnd { session_id, time } => {
            ctx.sessions
                .handle_end(&runner.namespace, &session_id, time)
                .await
        }
        RunnerFrame::Append { session_id, message } => {
            attach_session(ctx, runner, link, sessions, &session_id).await;
            ctx.messages
                .append(
                    &runner.namespace,
                    &session_id,
                    &message.content,
                    message.local_id.as_deref(),
                )
                .await?;
            Ok(())
        }
        RunnerFrame::PermissionRequest {
            session_id,
            id,
            tool,
            arguments,
            options,
        } => {
            attach_session(ctx, runner, link, sessions, &session_id).await;
            let request = PermissionRequest {
                id: id.clone(),
                tool,
                arguments,
                options,
                created_at: now_ms(),
            };
            let rx = ctx
                .broker
                .submit(&runner.namespace, &session_id, request)
                .await?;

            // The agent's tool call is suspended on this outcome; deliver it
            // back on the same connection once a decision lands.
            let link = link.clone();
            tokio::spawn(async move {
                let Ok(outcome) = rx.await else {
                    return;
                };
                let frame = HubFrame::PermissionDecision {
                    session_id,
                    request_id: id,
                    outcome,
                };
                if let Err(e) = link.send(frame).await {
                    debug!(err = %e, "permission decision undeliverable; runner gone");
                }
            });
            Ok(())
        }
        RunnerFrame::RpcResponse { id, result } => {
            if !ctx.runners.resolve_rpc(&id, result) {
                debug!(rpc = %id, "rpc response for unknown correlation id");
            }
            Ok(())
        }
    }
}

async fn attach_session(
    ctx: &Arc<AppContext>,
    runner: &Principal,
    link: &Arc<dyn AgentLink>,
    sessions: &mut HashSet<String>,
    session_id: &str,
) {
    if sessions.insert(session_id.to_string()) {
        ctx.runners
            .attach_session(&runner.namespace, session_id, link.clone())
            .await;
    }
}

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/cli/machines", post(upsert_machine))
        .route("/cli/machines/{id}", get(get_machine))
        .route("/cli/sessions", post(create_session))
        .route("/cli/sessions/merge", post(merge_sessions))
        .route("/cli/sessions/{id}", get(get_session))
        .route("/cli/sessions/{id}/messages", get(tail_messages))
        .route("/cli", any(runner_ws))
}
