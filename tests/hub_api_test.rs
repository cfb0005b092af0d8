//! HTTP-plane integration tests: boots a real hub and drives it with reqwest.

mod common;

use common::{start_hub, TestHub};
use serde_json::{json, Value};

async fn create_session(hub: &TestHub, tag: &str) -> Value {
    let resp = hub
        .http()
        .post(hub.url("/cli/sessions"))
        .bearer_auth(&hub.runner_token)
        .json(&json!({"tag": tag, "metadata": {"name": tag}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json::<Value>().await.unwrap()["session"].clone()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let hub = start_hub().await;
    let resp = hub.http().get(hub.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn auth_is_required_and_plane_scoped() {
    let hub = start_hub().await;

    // No token at all.
    let resp = hub.http().get(hub.url("/api/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // A runner token cannot use the client plane.
    let resp = hub
        .http()
        .get(hub.url("/api/sessions"))
        .bearer_auth(&hub.runner_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // A user token cannot use the runner plane.
    let resp = hub
        .http()
        .post(hub.url("/cli/sessions"))
        .bearer_auth(&hub.user_token)
        .json(&json!({"metadata": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn session_create_is_tag_idempotent_and_listed() {
    let hub = start_hub().await;
    let first = create_session(&hub, "work-1").await;
    let second = create_session(&hub, "work-1").await;
    assert_eq!(first["id"], second["id"]);

    let resp = hub
        .http()
        .get(hub.url("/api/sessions"))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], first["id"]);
    assert_eq!(sessions[0]["metadata"]["name"], "work-1");
}

#[tokio::test]
async fn foreign_namespace_ids_are_denied_not_leaked() {
    let hub = start_hub().await;
    let session = create_session(&hub, "mine").await;
    let sid = session["id"].as_str().unwrap();

    let outsider = hub.mint("ns-b", "user").await;
    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&outsider)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "access-denied");

    // The outsider's listing stays empty.
    let resp = hub
        .http()
        .get(hub.url("/api/sessions"))
        .bearer_auth(&outsider)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["sessions"].as_array().unwrap().is_empty());

    // A genuinely unknown id is a plain 404.
    let resp = hub
        .http()
        .get(hub.url("/api/sessions/no-such-id"))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn rename_conflict_returns_latest_snapshot() {
    let hub = start_hub().await;
    let session = create_session(&hub, "rename-me").await;
    let sid = session["id"].as_str().unwrap();
    assert_eq!(session["metadataVersion"], 0);

    let resp = hub
        .http()
        .patch(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .json(&json!({"name": "first", "expectedVersion": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session"]["metadataVersion"], 1);
    assert_eq!(body["session"]["metadata"]["name"], "first");
    // Rename does not resort the session list.
    assert_eq!(body["session"]["updatedAt"], session["updatedAt"]);

    // Second writer raced and lost: 409 with the current snapshot.
    let resp = hub
        .http()
        .patch(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .json(&json!({"name": "second", "expectedVersion": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "version_mismatch");
    assert_eq!(body["session"]["metadataVersion"], 1);
    assert_eq!(body["session"]["metadata"]["name"], "first");
}

#[tokio::test]
async fn message_paging_has_stable_cursors() {
    let hub = start_hub().await;
    let session = create_session(&hub, "paging").await;
    let sid = session["id"].as_str().unwrap();

    for i in 1..=5 {
        hub.ctx
            .messages
            .append("ns-a", sid, &json!({"n": i}), None)
            .await
            .unwrap();
    }

    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}/messages?limit=2")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let seqs: Vec<i64> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![4, 5]);
    assert_eq!(body["page"]["hasMore"], true);
    assert_eq!(body["page"]["nextBeforeSeq"], 4);

    // Follow the cursor to the start of the log.
    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}/messages?beforeSeq=4&limit=10")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let seqs: Vec<i64> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(body["page"]["hasMore"], false);

    // Boundary cases: before the first message, and a zero limit.
    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}/messages?beforeSeq=1")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["messages"].as_array().unwrap().is_empty());
    assert_eq!(body["page"]["hasMore"], false);

    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}/messages?limit=0")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["messages"].as_array().unwrap().is_empty());
    assert_eq!(body["page"]["hasMore"], false);
}

#[tokio::test]
async fn posted_user_messages_are_idempotent_by_local_id() {
    let hub = start_hub().await;
    let session = create_session(&hub, "chat").await;
    let sid = session["id"].as_str().unwrap();

    let resp = hub
        .http()
        .post(hub.url(&format!("/api/sessions/{sid}/messages")))
        .bearer_auth(&hub.user_token)
        .json(&json!({"text": "hi", "localId": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["message"]["seq"], 1);
    assert_eq!(first["message"]["content"]["text"], "hi");

    // Client retry with the same idempotency key: same row, same seq.
    let resp = hub
        .http()
        .post(hub.url(&format!("/api/sessions/{sid}/messages")))
        .bearer_auth(&hub.user_token)
        .json(&json!({"text": "hi again", "localId": "x"}))
        .send()
        .await
        .unwrap();
    let second: Value = resp.json().await.unwrap();
    assert_eq!(second["message"]["seq"], 1);
    assert_eq!(second["message"]["content"]["text"], "hi");

    let session = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(session["session"]["seq"], 1);
}

#[tokio::test]
async fn delete_refuses_active_then_succeeds() {
    let hub = start_hub().await;
    let session = create_session(&hub, "doomed").await;
    let sid = session["id"].as_str().unwrap();

    hub.ctx
        .sessions
        .handle_alive(
            "ns-a",
            hubd::session::SessionAlive {
                session_id: sid.to_string(),
                time: hubd::storage::now_ms(),
                thinking: None,
                permission_mode: None,
                model_mode: None,
            },
        )
        .await
        .unwrap();

    let resp = hub
        .http()
        .delete(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    hub.ctx
        .sessions
        .handle_end("ns-a", sid, hubd::storage::now_ms())
        .await
        .unwrap();
    let resp = hub
        .http()
        .delete(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = hub
        .http()
        .get(hub.url(&format!("/api/sessions/{sid}")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn machine_registration_and_offline_rpc() {
    let hub = start_hub().await;

    let resp = hub
        .http()
        .post(hub.url("/cli/machines"))
        .bearer_auth(&hub.runner_token)
        .json(&json!({"id": "laptop-1", "metadata": {"host": "laptop"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Upsert is idempotent: the original metadata stays.
    let resp = hub
        .http()
        .post(hub.url("/cli/machines"))
        .bearer_auth(&hub.runner_token)
        .json(&json!({"id": "laptop-1", "metadata": {"host": "other"}}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["machine"]["metadata"]["host"], "laptop");

    let resp = hub
        .http()
        .get(hub.url("/api/machines"))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["machines"].as_array().unwrap().len(), 1);

    // No live runner link: the spawn RPC fails fast with a gateway error.
    let resp = hub
        .http()
        .post(hub.url("/api/machines/laptop-1/spawn"))
        .bearer_auth(&hub.user_token)
        .json(&json!({"directory": "/tmp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn preferences_and_push_subscriptions_round_trip() {
    let hub = start_hub().await;

    let resp = hub
        .http()
        .put(hub.url("/api/preferences/session-sort"))
        .bearer_auth(&hub.user_token)
        .json(&json!({"value": "recent"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = hub
        .http()
        .get(hub.url("/api/preferences/session-sort"))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["value"], "recent");

    let resp = hub
        .http()
        .post(hub.url("/api/push/subscribe"))
        .bearer_auth(&hub.user_token)
        .json(&json!({"endpoint": "https://push.example/abc", "keys": {"p256dh": "k"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sub: Value = resp.json().await.unwrap();
    let sub_id = sub["subscription"]["id"].as_str().unwrap().to_string();

    let resp = hub
        .http()
        .get(hub.url("/api/push/subscriptions"))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["subscriptions"].as_array().unwrap().len(), 1);

    let resp = hub
        .http()
        .delete(hub.url(&format!("/api/push/subscribe/{sub_id}")))
        .bearer_auth(&hub.user_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
