//! Hub-side view of the duplex runner channel.
//!
//! The hub never talks to a concrete socket directly; it holds an
//! [`AgentLink`] capability per connected runner and a registry mapping
//! sessions/machines to the link currently serving them. Hub→runner RPCs
//! (spawn, path checks) are correlated through one-shot waiters.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use crate::messages::MessageView;
use crate::permissions::PermissionOutcome;

/// How long a hub→runner RPC waits for the runner's reply.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames the hub pushes down the runner channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HubFrame {
    /// A user message was appended; the agent should pick it up.
    NewMessage {
        session_id: String,
        message: MessageView,
    },
    /// Resolution of a previously submitted permission request.
    PermissionDecision {
        session_id: String,
        request_id: String,
        outcome: PermissionOutcome,
    },
    /// Client-pushed session configuration change.
    SessionConfig {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_mode: Option<String>,
    },
    /// Abort the agent's in-flight prompt.
    CancelPrompt {
        session_id: String,
        reason: String,
    },
    /// Correlated request; the runner answers with an `rpc-response` frame.
    RpcRequest {
        id: String,
        method: String,
        params: Value,
    },
}

/// Capability to deliver frames to one connected runner.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn send(&self, frame: HubFrame) -> Result<()>;
}

/// Maps live sessions and machines to the runner link serving them, and
/// correlates hub→runner RPC replies.
#[derive(Default)]
pub struct RunnerRegistry {
    sessions: RwLock<HashMap<(String, String), Arc<dyn AgentLink>>>,
    machines: RwLock<HashMap<(String, String), Arc<dyn AgentLink>>>,
    rpc_waiters: StdMutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach_session(&self, namespace: &str, session_id: &str, link: Arc<dyn AgentLink>) {
        self.sessions
            .write()
            .await
            .insert((namespace.to_string(), session_id.to_string()), link);
    }

    pub async fn detach_session(&self, namespace: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .remove(&(namespace.to_string(), session_id.to_string()));
    }

    pub async fn attach_machine(&self, namespace: &str, machine_id: &str, link: Arc<dyn AgentLink>) {
        self.machines
            .write()
            .await
            .insert((namespace.to_string(), machine_id.to_string()), link);
    }

    pub async fn detach_machine(&self, namespace: &str, machine_id: &str) {
        self.machines
            .write()
            .await
            .remove(&(namespace.to_string(), machine_id.to_string()));
    }

    async fn session_link(&self, namespace: &str, session_id: &str) -> Option<Arc<dyn AgentLink>> {
        self.sessions
            .read()
            .await
            .get(&(namespace.to_string(), session_id.to_string()))
            .cloned()
    }

    /// Deliver a frame to the session's runner. Returns `false` when no
    /// runner currently serves the session.
    pub async fn send_to_session(
        &self,
        namespace: &str,
        session_id: &str,
        frame: HubFrame,
    ) -> Result<bool> {
        match self.session_link(namespace, session_id).await {
            Some(link) => {
                link.send(frame).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Abort the agent's current prompt, if a runner is connected.
    pub async fn cancel_prompt(&self, namespace: &str, session_id: &str, reason: &str) -> Result<bool> {
        self.send_to_session(
            namespace,
            session_id,
            HubFrame::CancelPrompt {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Correlated RPC to a machine's runner; waits for the reply frame.
    pub async fn call_machine(
        &self,
        namespace: &str,
        machine_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let link = self
            .machines
            .read()
            .await
            .get(&(namespace.to_string(), machine_id.to_string()))
            .cloned();
        let Some(link) = link else {
            anyhow::bail!("no runner connected for machine {machine_id}");
        };

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.rpc_waiters.lock().unwrap().insert(id.clone(), tx);

        let sent = link
            .send(HubFrame::RpcRequest {
                id: id.clone(),
                method: method.to_string(),
                params,
            })
            .await;
        if let Err(e) = sent {
            self.rpc_waiters.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                anyhow::bail!("runner link dropped while awaiting rpc {method}")
            }
            Err(_) => {
                self.rpc_waiters.lock().unwrap().remove(&id);
                anyhow::bail!("rpc {method} to machine {machine_id} timed out")
            }
        }
    }

    /// Complete a waiter from an inbound `rpc-response` frame.
    pub fn resolve_rpc(&self, id: &str, value: Value) -> bool {
        match self.rpc_waiters.lock().unwrap().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records frames instead of writing to a socket.
    #[derive(Default)]
    pub struct RecordingLink {
        pub frames: Mutex<Vec<HubFrame>>,
    }

    #[async_trait]
    impl AgentLink for RecordingLink {
        async fn send(&self, frame: HubFrame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLink;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_to_session_requires_attachment() {
        let registry = RunnerRegistry::new();
        let delivered = registry
            .cancel_prompt("ns", "s1", "nobody home")
            .await
            .unwrap();
        assert!(!delivered);

        let link = Arc::new(RecordingLink::default());
        registry.attach_session("ns", "s1", link.clone()).await;
        assert!(registry.cancel_prompt("ns", "s1", "stop").await.unwrap());
        // Wrong namespace does not reach the link.
        assert!(!registry.cancel_prompt("other", "s1", "stop").await.unwrap());

        let frames = link.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            HubFrame::CancelPrompt { session_id, reason } => {
                assert_eq!(session_id, "s1");
                assert_eq!(reason, "stop");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn machine_rpc_round_trip() {
        let registry = Arc::new(RunnerRegistry::new());
        let link = Arc::new(RecordingLink::default());
        registry.attach_machine("ns", "m1", link.clone()).await;

        let registry_bg = registry.clone();
        let link_bg = link.clone();
        let responder = tokio::spawn(async move {
            // Poll until the frame lands, then answer like a runner would.
            loop {
                let id = {
                    let frames = link_bg.frames.lock().unwrap();
                    frames.iter().find_map(|f| match f {
                        HubFrame::RpcRequest { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                };
                if let Some(id) = id {
                    assert!(registry_bg.resolve_rpc(&id, json!({"exists": true})));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = registry
            .call_machine("ns", "m1", "path-exists", json!({"path": "/tmp"}))
            .await
            .unwrap();
        assert_eq!(result["exists"], true);
        responder.await.unwrap();

        // A reply for an unknown id is ignored.
        assert!(!registry.resolve_rpc("bogus", json!({})));
    }

    #[tokio::test]
    async fn machine_rpc_without_link_fails() {
        let registry = RunnerRegistry::new();
        let err = registry
            .call_machine("ns", "ghost", "spawn", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no runner connected"));
    }

    #[test]
    fn frame_wire_shape() {
        let frame = HubFrame::SessionConfig {
            session_id: "s1".into(),
            permission_mode: Some("plan".into()),
            model_mode: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["t"], "session-config");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["permissionMode"], "plan");
        assert!(json.get("modelMode").is_none());
    }
}
