// rest/mod.rs — client-facing plane.
//
// Axum routes under /api plus the /webapp WebSocket. Every endpoint is
// namespace-scoped through the bearer-token principal.
//
// Endpoints:
//   GET    /api/sessions
//   GET    /api/sessions/{id}            PATCH (rename)  DELETE
//   POST   /api/sessions/{id}/abort
//   POST   /api/sessions/{id}/permission-mode
//   POST   /api/sessions/{id}/model
//   GET    /api/sessions/{id}/messages   POST (send user message)
//   POST   /api/sessions/{id}/permissions/{requestId}/approve | /deny
//   GET    /api/machines
//   POST   /api/machines/{id}/spawn
//   POST   /api/machines/{id}/paths/exists
//   POST   /api/push/subscribe           DELETE /api/push/subscribe/{id}
//   GET    /api/push/subscriptions
//   GET    /api/preferences/{key}        PUT
//   POST   /api/visibility
//   GET    /api/events                   (SSE)
//   ANY    /webapp                       (WebSocket subscription)

pub mod auth;
pub mod error;
pub mod routes;
pub mod sse;
pub mod ws;

use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;

use crate::AppContext;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(routes::sessions::get_session)
                .patch(routes::sessions::rename_session)
                .delete(routes::sessions::delete_session),
        )
        .route("/api/sessions/{id}/abort", post(routes::sessions::abort_session))
        .route(
            "/api/sessions/{id}/permission-mode",
            post(routes::sessions::set_permission_mode),
        )
        .route("/api/sessions/{id}/model", post(routes::sessions::set_model_mode))
        .route(
            "/api/sessions/{id}/messages",
            get(routes::sessions::get_messages).post(routes::sessions::post_message),
        )
        .route(
            "/api/sessions/{id}/permissions/{request_id}/approve",
            post(routes::sessions::approve_permission),
        )
        .route(
            "/api/sessions/{id}/permissions/{request_id}/deny",
            post(routes::sessions::deny_permission),
        )
        .route("/api/machines", get(routes::machines::list_machines))
        .route("/api/machines/{id}/spawn", post(routes::machines::spawn_session))
        .route(
            "/api/machines/{id}/paths/exists",
            post(routes::machines::path_exists),
        )
        .route("/api/push/subscribe", post(routes::account::push_subscribe))
        .route(
            "/api/push/subscribe/{id}",
            axum::routing::delete(routes::account::push_unsubscribe),
        )
        .route("/api/push/subscriptions", get(routes::account::push_subscriptions))
        .route(
            "/api/preferences/{key}",
            get(routes::account::get_preference).put(routes::account::put_preference),
        )
        .route("/api/visibility", post(routes::account::set_visibility))
        .route("/api/events", get(sse::events_sse))
        .route("/webapp", any(ws::webapp_ws))
}
