//! Broker for in-flight permission requests.
//!
//! When an agent blocks on a dangerous tool call, the runner submits a
//! request here and suspends on the returned completion handle. A client
//! decision (or an abort cascade, a runner disconnect, or the timeout sweep)
//! resolves the handle exactly once; late responses for the same id are
//! no-ops. Every transition is mirrored into the owning session's agent
//! state so subscribers see the pending/completed maps move.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::events::{EventPublisher, SyncEvent};
use crate::push::PushDelivery;
use crate::session::SessionCache;
use crate::storage::{now_ms, Storage};
use crate::transport::RunnerRegistry;

// ─── Wire types ───────────────────────────────────────────────────────────────

/// Kind of outcome an option represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

/// One named outcome the user may choose from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub id: String,
    pub name: String,
    pub kind: OptionKind,
}

/// A blocked agent invocation awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub options: Vec<PermissionOption>,
    pub created_at: i64,
}

/// The client's semantic choice, mapped onto a concrete option kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

/// What the blocked runner call resumes with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PermissionOutcome {
    Selected { option_id: String },
    Cancelled { reason: String },
}

/// Optional attachments on a client response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseExtras {
    pub reason: Option<String>,
    pub allow_tools: Option<Vec<String>>,
    pub answers: Option<Value>,
}

/// Map a decision onto the request's options.
///
/// Each decision prefers one kind and falls back to its sibling:
/// `approved` → allow_once then allow_always; `approved_for_session` the
/// reverse; `denied` → reject_once then reject_always. `abort` maps to no
/// option at all.
pub fn select_option(decision: Decision, options: &[PermissionOption]) -> Option<&PermissionOption> {
    let find = |kind: OptionKind| options.iter().find(|o| o.kind == kind);
    match decision {
        Decision::Approved => find(OptionKind::AllowOnce).or_else(|| find(OptionKind::AllowAlways)),
        Decision::ApprovedForSession => {
            find(OptionKind::AllowAlways).or_else(|| find(OptionKind::AllowOnce))
        }
        Decision::Denied => find(OptionKind::RejectOnce).or_else(|| find(OptionKind::RejectAlways)),
        Decision::Abort => None,
    }
}

// ─── Broker ──────────────────────────────────────────────────────────────────

struct PendingEntry {
    request: PermissionRequest,
    tx: oneshot::Sender<PermissionOutcome>,
}

pub struct PermissionBroker {
    sessions: Arc<SessionCache>,
    runners: Arc<RunnerRegistry>,
    storage: Arc<Storage>,
    publisher: EventPublisher,
    push: Arc<dyn PushDelivery>,
    pending: StdMutex<HashMap<(String, String), HashMap<String, PendingEntry>>>,
}

impl PermissionBroker {
    pub fn new(
        sessions: Arc<SessionCache>,
        runners: Arc<RunnerRegistry>,
        storage: Arc<Storage>,
        publisher: EventPublisher,
        push: Arc<dyn PushDelivery>,
    ) -> Self {
        Self {
            sessions,
            runners,
            storage,
            publisher,
            push,
            pending: StdMutex::new(HashMap::new()),
        }
    }

    /// Number of requests currently awaiting a decision for a session.
    pub fn pending_count(&self, namespace: &str, session_id: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), session_id.to_string()))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Accept a request from the runner and hand back the completion handle
    /// the transport suspends on. Mirrors the request into the session's
    /// agent state and notifies clients.
    pub async fn submit(
        &self,
        namespace: &str,
        session_id: &str,
        request: PermissionRequest,
    ) -> Result<oneshot::Receiver<PermissionOutcome>> {
        if request.options.is_empty() {
            anyhow::bail!("permission request {} has no options", request.id);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            let per_session = pending
                .entry((namespace.to_string(), session_id.to_string()))
                .or_default();
            if per_session.contains_key(&request.id) {
                anyhow::bail!("permission request {} already pending", request.id);
            }
            per_session.insert(
                request.id.clone(),
                PendingEntry {
                    request: request.clone(),
                    tx,
                },
            );
        }

        let record = json!({
            "tool": request.tool,
            "arguments": request.arguments,
            "options": request.options,
            "createdAt": request.created_at,
        });
        if let Err(e) = self
            .sessions
            .record_permission_request(namespace, session_id, &request.id, record)
            .await
        {
            // Session is gone; withdraw the entry so nothing leaks.
            self.take_entry(namespace, session_id, &request.id);
            return Err(e);
        }

        self.notify_request(namespace, session_id, &request).await;
        Ok(rx)
    }

    /// Toast for foregrounded clients plus a push hand-off for everyone else.
    async fn notify_request(&self, namespace: &str, session_id: &str, request: &PermissionRequest) {
        let body = format!("Agent asks to run {}", request.tool);
        self.publisher.emit(SyncEvent::Toast {
            namespace: namespace.to_string(),
            title: "Permission required".to_string(),
            body: body.clone(),
            session_id: Some(session_id.to_string()),
        });
        match self.storage.list_push_subscriptions_for_namespace(namespace).await {
            Ok(subs) => {
                for sub in subs {
                    self.push.notify(&sub, "Permission required", &body).await;
                }
            }
            Err(e) => warn!(err = %e, "failed to list push subscriptions"),
        }
    }

    fn take_entry(&self, namespace: &str, session_id: &str, request_id: &str) -> Option<PendingEntry> {
        let mut pending = self.pending.lock().unwrap();
        let key = (namespace.to_string(), session_id.to_string());
        let per_session = pending.get_mut(&key)?;
        let entry = per_session.remove(request_id);
        if per_session.is_empty() {
            pending.remove(&key);
        }
        entry
    }

    fn take_all(&self, namespace: &str, session_id: &str) -> Vec<PendingEntry> {
        let mut pending = self.pending.lock().unwrap();
        pending
            .remove(&(namespace.to_string(), session_id.to_string()))
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }

    /// Apply a client decision.
    ///
    /// Unknown request ids are a no-op (`Ok(None)`): the request was already
    /// resolved, expired, or never existed, and reprocessing is harmless.
    /// An `abort` resolves the named request as cancelled, cancels the
    /// agent's current prompt, and cascades to every other pending request
    /// in the session.
    pub async fn respond(
        &self,
        namespace: &str,
        session_id: &str,
        request_id: &str,
        decision: Decision,
        extras: ResponseExtras,
    ) -> Result<Option<Decision>> {
        let Some(entry) = self.take_entry(namespace, session_id, request_id) else {
            debug!(rid = %request_id, "response for unknown permission request ignored");
            return Ok(None);
        };
        let request = entry.request;

        let (outcome, status) = match select_option(decision, &request.options) {
            Some(option) => (
                PermissionOutcome::Selected {
                    option_id: option.id.clone(),
                },
                match decision {
                    Decision::Approved | Decision::ApprovedForSession => "approved",
                    _ => "denied",
                },
            ),
            None => (
                PermissionOutcome::Cancelled {
                    reason: if decision == Decision::Abort {
                        "user aborted".to_string()
                    } else {
                        "no matching option".to_string()
                    },
                },
                "canceled",
            ),
        };

        let _ = entry.tx.send(outcome.clone());

        let completed = completed_record(&request, status, Some(decision), &extras, &outcome);
        self.sessions
            .complete_permission_request(namespace, session_id, request_id, completed)
            .await?;

        if decision == Decision::Abort {
            if let Err(e) = self
                .runners
                .cancel_prompt(namespace, session_id, "user aborted")
                .await
            {
                warn!(sid = %session_id, err = %e, "failed to cancel agent prompt");
            }
            self.cancel_all(namespace, session_id, "user aborted", Some(Decision::Abort))
                .await?;
        }
        Ok(Some(decision))
    }

    /// Resolve every pending request in a session as cancelled.
    pub async fn cancel_all(
        &self,
        namespace: &str,
        session_id: &str,
        reason: &str,
        decision: Option<Decision>,
    ) -> Result<usize> {
        let entries = self.take_all(namespace, session_id);
        let n = entries.len();
        for entry in entries {
            let outcome = PermissionOutcome::Cancelled {
                reason: reason.to_string(),
            };
            let _ = entry.tx.send(outcome.clone());
            let mut completed = completed_record(
                &entry.request,
                "canceled",
                decision,
                &ResponseExtras::default(),
                &outcome,
            );
            completed["reason"] = Value::String(reason.to_string());
            self.sessions
                .complete_permission_request(namespace, session_id, &entry.request.id, completed)
                .await?;
        }
        Ok(n)
    }

    /// Timeout sweep: cancel every pending request created before `cutoff`.
    /// Driven by the periodic monitor, not by the broker itself.
    pub async fn expire_older_than(&self, cutoff: i64) -> Result<usize> {
        let expired: Vec<(String, String, PendingEntry)> = {
            let mut pending = self.pending.lock().unwrap();
            let mut out = Vec::new();
            for ((ns, sid), per_session) in pending.iter_mut() {
                let ids: Vec<String> = per_session
                    .iter()
                    .filter(|(_, e)| e.request.created_at < cutoff)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    if let Some(entry) = per_session.remove(&id) {
                        out.push((ns.clone(), sid.clone(), entry));
                    }
                }
            }
            pending.retain(|_, m| !m.is_empty());
            out
        };

        let n = expired.len();
        for (namespace, session_id, entry) in expired {
            let outcome = PermissionOutcome::Cancelled {
                reason: "timeout".to_string(),
            };
            let _ = entry.tx.send(outcome.clone());
            let mut completed = completed_record(
                &entry.request,
                "canceled",
                None,
                &ResponseExtras::default(),
                &outcome,
            );
            completed["reason"] = Value::String("timeout".to_string());
            if let Err(e) = self
                .sessions
                .complete_permission_request(&namespace, &session_id, &entry.request.id, completed)
                .await
            {
                warn!(sid = %session_id, err = %e, "failed to mirror expired permission request");
            }
        }
        Ok(n)
    }
}

/// Terminal form persisted into `agentState.completedRequests`.
fn completed_record(
    request: &PermissionRequest,
    status: &str,
    decision: Option<Decision>,
    extras: &ResponseExtras,
    outcome: &PermissionOutcome,
) -> Value {
    let mut record = json!({
        "tool": request.tool,
        "arguments": request.arguments,
        "options": request.options,
        "createdAt": request.created_at,
        "completedAt": now_ms(),
        "status": status,
    });
    if let Some(d) = decision {
        record["decision"] = serde_json::to_value(d).unwrap_or(Value::Null);
    }
    if let PermissionOutcome::Selected { option_id } = outcome {
        record["optionId"] = Value::String(option_id.clone());
    }
    if let Some(reason) = &extras.reason {
        record["reason"] = Value::String(reason.clone());
    }
    if let Some(allow) = &extras.allow_tools {
        record["allowTools"] = json!(allow);
    }
    if let Some(answers) = &extras.answers {
        record["answers"] = answers.clone();
    }
    record
}
