pub mod alive;
pub mod auth;
pub mod config;
pub mod events;
pub mod fanout;
pub mod machine;
pub mod messages;
pub mod permissions;
pub mod push;
pub mod rest;
pub mod runner;
pub mod session;
pub mod storage;
pub mod transport;

use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use config::HubConfig;
use events::EventPublisher;
use fanout::Fanout;
use machine::MachineCache;
use messages::MessageLog;
use permissions::PermissionBroker;
use push::{LogPushDelivery, PushDelivery};
use session::SessionCache;
use storage::Storage;
use transport::RunnerRegistry;

/// Shared application state passed to every route handler and background task.
pub struct AppContext {
    pub config: Arc<HubConfig>,
    pub storage: Arc<Storage>,
    pub publisher: EventPublisher,
    pub sessions: Arc<SessionCache>,
    pub machines: Arc<MachineCache>,
    pub messages: Arc<MessageLog>,
    pub fanout: Arc<Fanout>,
    pub runners: Arc<RunnerRegistry>,
    pub broker: Arc<PermissionBroker>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub async fn new(config: HubConfig) -> Result<Arc<Self>> {
        Self::with_push(config, Arc::new(LogPushDelivery)).await
    }

    /// Assemble the hub with a specific push-delivery collaborator.
    pub async fn with_push(config: HubConfig, push: Arc<dyn PushDelivery>) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let publisher = EventPublisher::new();
        let sessions = Arc::new(SessionCache::new(
            storage.clone(),
            publisher.clone(),
            config.liveness_window_ms,
            config.broadcast_gap_ms,
        ));
        let machines = Arc::new(MachineCache::new(
            storage.clone(),
            publisher.clone(),
            config.liveness_window_ms,
            config.broadcast_gap_ms,
        ));
        let messages = Arc::new(MessageLog::new(storage.clone(), publisher.clone()));
        let runners = Arc::new(RunnerRegistry::new());
        let broker = Arc::new(PermissionBroker::new(
            sessions.clone(),
            runners.clone(),
            storage.clone(),
            publisher.clone(),
            push,
        ));
        let fanout = Arc::new(Fanout::new(
            publisher.clone(),
            Duration::from_millis(config.heartbeat_interval_ms),
            config.subscription_queue,
        ));

        Ok(Arc::new(Self {
            config,
            storage,
            publisher,
            sessions,
            machines,
            messages,
            fanout,
            runners,
            broker,
            started_at: std::time::Instant::now(),
        }))
    }

    /// Start the fanout bridge and the liveness/permission sweep.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(self.fanout.clone().run()),
            alive::spawn(
                self.sessions.clone(),
                self.machines.clone(),
                self.broker.clone(),
                Duration::from_millis(self.config.sweep_interval_ms),
                self.config.permission_timeout_ms,
            ),
        ]
    }
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "subscriptions": ctx.fanout.subscription_count().await,
    }))
}

/// Both planes plus the unauthenticated health probe on one router.
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(rest::router())
        .merge(runner::router())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
