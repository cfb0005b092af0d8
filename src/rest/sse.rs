//! Server-Sent Events subscription endpoint.
//!
//! `GET /api/events?all=&sessionId=&machineId=&visibility=&token=` opens a
//! scoped subscription. The first frame announces the subscription id so the
//! client can address `POST /api/visibility` at it. When the client goes
//! away the queue backs up and the fanout closes the subscription.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::fanout::{Outbound, SubscriptionScope, Visibility};
use crate::rest::auth::AuthedUser;
use crate::rest::error::ApiError;
use crate::AppContext;

/// Scope selection: a bare request (or `all=true`) is the namespace
/// firehose; `sessionId`/`machineId` narrow it. Unknown parameters are
/// ignored.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
    pub visibility: Option<Visibility>,
}

pub fn scope_from(
    session_id: Option<String>,
    machine_id: Option<String>,
) -> Result<SubscriptionScope, ApiError> {
    match (session_id, machine_id) {
        (Some(_), Some(_)) => Err(ApiError::Validation(
            "sessionId and machineId are mutually exclusive".into(),
        )),
        (Some(sid), None) => Ok(SubscriptionScope::Session(sid)),
        (None, Some(mid)) => Ok(SubscriptionScope::Machine(mid)),
        (None, None) => Ok(SubscriptionScope::All),
    }
}

pub async fn events_sse(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user): AuthedUser,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let scope = scope_from(query.session_id, query.machine_id)?;
    let visibility = query.visibility.unwrap_or(Visibility::Visible);

    let (id, rx) = ctx
        .fanout
        .subscribe(&user.namespace, &user.user_id, scope, visibility)
        .await;

    let hello = Event::default()
        .event("subscribed")
        .data(json!({ "id": id }).to_string());

    let feed = ReceiverStream::new(rx).map(|out| {
        Ok::<Event, Infallible>(match out {
            Outbound::Event(event) => Event::default()
                .event("sync")
                .data(serde_json::to_string(&event).unwrap_or_default()),
            Outbound::Heartbeat => Event::default().comment("ping"),
        })
    });
    let s = stream::once(async move { Ok(hello) }).chain(feed);

    Ok(Sse::new(s).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ka"),
    ))
}
