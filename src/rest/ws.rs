//! WebSocket flavor of the subscription contract (`/webapp`).
//!
//! The client opens the socket, sends a `subscribe` frame with the same
//! fields as the SSE query, and receives `subscribed` + a stream of `event`
//! frames. A later `subscribe` replaces the previous scope.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::fanout::{Outbound, Visibility};
use crate::rest::auth::AuthedUser;
use crate::rest::sse::scope_from;
use crate::AppContext;

#[derive(Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum ClientFrame {
    Subscribe {
        session_id: Option<String>,
        machine_id: Option<String>,
        visibility: Option<Visibility>,
    },
    Visibility {
        visibility: Visibility,
    },
}

pub async fn webapp_ws(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(ctx, user, socket))
}

async fn handle_socket(ctx: Arc<AppContext>, user: Principal, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut active: Option<(String, mpsc::Receiver<Outbound>)> = None;

    loop {
        tokio::select! {
            out = async {
                match active.as_mut() {
                    Some((_, rx)) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let frame = match out {
                    Some(Outbound::Event(event)) => {
                        let payload = json!({ "t": "event", "event": event });
                        Message::Text(payload.to_string().into())
                    }
                    Some(Outbound::Heartbeat) => Message::Ping(Vec::new().into()),
                    // The fanout closed us (overflow); force a reconnect.
                    None => break,
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: ClientFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(err = %e, "ignoring malformed webapp frame");
                            continue;
                        }
                    };
                    match frame {
                        ClientFrame::Subscribe { session_id, machine_id, visibility, .. } => {
                            let scope = match scope_from(session_id, machine_id) {
                                Ok(scope) => scope,
                                Err(_) => {
                                    warn!("subscribe frame with conflicting scope ignored");
                                    continue;
                                }
                            };
                            if let Some((old_id, _)) = active.take() {
                                ctx.fanout.unsubscribe(&old_id).await;
                            }
                            let (id, rx) = ctx
                                .fanout
                                .subscribe(
                                    &user.namespace,
                                    &user.user_id,
                                    scope,
                                    visibility.unwrap_or(Visibility::Visible),
                                )
                                .await;
                            let ack = json!({ "t": "subscribed", "id": id });
                            if sink.send(Message::Text(ack.to_string().into())).await.is_err() {
                                ctx.fanout.unsubscribe(&id).await;
                                return;
                            }
                            active = Some((id, rx));
                        }
                        ClientFrame::Visibility { visibility } => {
                            if let Some((id, _)) = &active {
                                ctx.fanout.set_visibility(id, visibility).await;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(err = %e, "webapp socket error");
                    break;
                }
                _ => {}
            },
        }
    }

    if let Some((id, _)) = active {
        ctx.fanout.unsubscribe(&id).await;
    }
}
