//! Shared scaffolding for the integration suite: boots a real hub on a free
//! port with a scratch data directory and mints namespace-scoped tokens.
#![allow(dead_code)]

use hubd::{
    auth::{generate_token, hash_token},
    build_router,
    config::HubConfig,
    AppContext,
};
use std::sync::Arc;

pub struct TestHub {
    pub ctx: Arc<AppContext>,
    pub addr: String,
    pub user_token: String,
    pub runner_token: String,
    _dir: tempfile::TempDir,
}

impl TestHub {
    pub fn http(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str, token: &str) -> String {
        format!("ws://{}{}?token={}", self.addr, path, token)
    }

    /// Mint an extra token in an arbitrary namespace.
    pub async fn mint(&self, namespace: &str, kind: &str) -> String {
        let token = generate_token();
        self.ctx
            .storage
            .create_user(namespace, &hash_token(&token), kind)
            .await
            .unwrap();
        token
    }
}

pub async fn start_hub() -> TestHub {
    start_hub_with(|_| {}).await
}

/// Boot a hub, letting the caller tighten config knobs (liveness window,
/// sweep cadence) before startup.
pub async fn start_hub_with(tune: impl FnOnce(&mut HubConfig)) -> TestHub {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HubConfig::new(None, Some(dir.path().to_path_buf()), Some("warn".into()));
    tune(&mut config);

    let ctx = AppContext::new(config).await.unwrap();
    ctx.spawn_background();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let router = build_router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let user_token = generate_token();
    ctx.storage
        .create_user("ns-a", &hash_token(&user_token), "user")
        .await
        .unwrap();
    let runner_token = generate_token();
    ctx.storage
        .create_user("ns-a", &hash_token(&runner_token), "runner")
        .await
        .unwrap();

    TestHub {
        ctx,
        addr,
        user_token,
        runner_token,
        _dir: dir,
    }
}
