//! Routes published events to live client subscriptions.
//!
//! Each subscription owns a bounded outbound queue drained by its transport
//! task (SSE or WebSocket), so one slow client never blocks the publisher or
//! its neighbors. Queue overflow closes the subscription; the client
//! reconnects and catches up through the paginated read paths.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventPublisher, SyncEvent};

/// Default bound of a subscription's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What a subscription wants to observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Every namespace-scoped event.
    All,
    Session(String),
    Machine(String),
}

/// Whether the client is currently foregrounded. Toasts only go to visible
/// subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// One frame on a subscription's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(SyncEvent),
    Heartbeat,
}

struct Subscription {
    namespace: String,
    user_id: String,
    scope: SubscriptionScope,
    visibility: Visibility,
    tx: mpsc::Sender<Outbound>,
}

/// Scope and visibility filter for one event against one subscription.
fn should_deliver(
    event: &SyncEvent,
    namespace: &str,
    user_id: &str,
    scope: &SubscriptionScope,
    visibility: Visibility,
) -> bool {
    // User-routed events ignore namespace scoping entirely.
    if let Some(target) = event.target_user() {
        return target == user_id;
    }
    match event.namespace() {
        Some(ns) if ns == namespace => {}
        _ => return false,
    }
    if matches!(event, SyncEvent::Toast { .. }) && visibility != Visibility::Visible {
        return false;
    }
    match event {
        // Message traffic goes to exact session scopes and firehose
        // subscriptions only; machine scopes never see it.
        SyncEvent::MessageReceived { session_id, .. } => match scope {
            SubscriptionScope::All => true,
            SubscriptionScope::Session(s) => s == session_id,
            SubscriptionScope::Machine(_) => false,
        },
        _ => match scope {
            SubscriptionScope::All => true,
            SubscriptionScope::Session(s) => event.session_id() == Some(s.as_str()),
            SubscriptionScope::Machine(m) => event.machine_id() == Some(m.as_str()),
        },
    }
}

pub struct Fanout {
    publisher: EventPublisher,
    heartbeat_interval: Duration,
    queue_capacity: usize,
    subs: RwLock<HashMap<String, Subscription>>,
}

impl Fanout {
    pub fn new(publisher: EventPublisher, heartbeat_interval: Duration, queue_capacity: usize) -> Self {
        Self {
            publisher,
            heartbeat_interval,
            queue_capacity,
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscription; the caller drains the returned receiver onto
    /// its transport. Announces presence to the user's other connections.
    pub async fn subscribe(
        &self,
        namespace: &str,
        user_id: &str,
        scope: SubscriptionScope,
        visibility: Visibility,
    ) -> (String, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subs.write().await.insert(
            id.clone(),
            Subscription {
                namespace: namespace.to_string(),
                user_id: user_id.to_string(),
                scope,
                visibility,
                tx,
            },
        );
        debug!(sub = %id, user = %user_id, "subscription opened");
        self.publisher.emit(SyncEvent::ConnectionChanged {
            user_id: user_id.to_string(),
            connected: true,
        });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subs.write().await.remove(id);
        if let Some(sub) = removed {
            debug!(sub = %id, user = %sub.user_id, "subscription closed");
            self.publisher.emit(SyncEvent::ConnectionChanged {
                user_id: sub.user_id,
                connected: false,
            });
            true
        } else {
            false
        }
    }

    /// Flip the foreground flag that gates toast delivery.
    pub async fn set_visibility(&self, id: &str, visibility: Visibility) -> bool {
        match self.subs.write().await.get_mut(id) {
            Some(sub) => {
                sub.visibility = visibility;
                true
            }
            None => false,
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subs.read().await.len()
    }

    /// Bridge task: consume the publisher feed and the heartbeat ticker.
    /// A single consumer keeps per-subscription delivery in emit order.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.publisher.subscribe();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events are recovered by clients via catch-up
                        // pagination after their next reconnect.
                        warn!(skipped = n, "fanout lagged behind the publisher");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.heartbeat_all().await,
            }
        }
        info!("fanout stopped");
    }

    async fn dispatch(&self, event: SyncEvent) {
        let targets: Vec<(String, mpsc::Sender<Outbound>)> = {
            let subs = self.subs.read().await;
            subs.iter()
                .filter(|(_, s)| {
                    should_deliver(&event, &s.namespace, &s.user_id, &s.scope, s.visibility)
                })
                .map(|(id, s)| (id.clone(), s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(Outbound::Event(event.clone())).is_err() {
                dead.push(id);
            }
        }
        self.drop_dead(dead).await;
    }

    async fn heartbeat_all(&self) {
        let targets: Vec<(String, mpsc::Sender<Outbound>)> = {
            let subs = self.subs.read().await;
            subs.iter().map(|(id, s)| (id.clone(), s.tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(Outbound::Heartbeat).is_err() {
                dead.push(id);
            }
        }
        self.drop_dead(dead).await;
    }

    /// A full queue or a gone receiver both mean the client cannot keep up;
    /// the subscription is closed so the publisher is never the one waiting.
    async fn drop_dead(&self, dead: Vec<String>) {
        for id in dead {
            warn!(sub = %id, "subscription overflowed or vanished; closing");
            self.unsubscribe(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineView;
    use crate::messages::MessageView;
    use crate::session::SessionView;
    use serde_json::{json, Value};

    fn session_view(id: &str, namespace: &str) -> SessionView {
        SessionView {
            id: id.to_string(),
            namespace: namespace.to_string(),
            tag: None,
            seq: 0,
            metadata: Value::Null,
            metadata_version: 0,
            agent_state: Value::Null,
            agent_state_version: 0,
            todos: None,
            todos_updated_at: 0,
            active: false,
            active_at: 0,
            thinking: false,
            thinking_at: 0,
            permission_mode: "default".into(),
            model_mode: "default".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn message_event(namespace: &str, session_id: &str) -> SyncEvent {
        SyncEvent::MessageReceived {
            namespace: namespace.to_string(),
            session_id: session_id.to_string(),
            message: MessageView {
                id: "m".into(),
                seq: 1,
                local_id: None,
                content: json!({}),
                created_at: 0,
                usage: None,
            },
        }
    }

    fn machine_event(namespace: &str, machine_id: &str) -> SyncEvent {
        SyncEvent::MachineUpdated {
            namespace: namespace.to_string(),
            machine: MachineView {
                id: machine_id.to_string(),
                namespace: namespace.to_string(),
                metadata: Value::Null,
                metadata_version: 0,
                runner_state: Value::Null,
                runner_state_version: 0,
                active: true,
                active_at: 0,
                created_at: 0,
                updated_at: 0,
            },
        }
    }

    fn check(
        event: &SyncEvent,
        namespace: &str,
        user: &str,
        scope: SubscriptionScope,
        visibility: Visibility,
    ) -> bool {
        should_deliver(event, namespace, user, &scope, visibility)
    }

    #[test]
    fn namespace_mismatch_is_dropped() {
        let ev = SyncEvent::SessionUpdated {
            namespace: "a".into(),
            session: session_view("s1", "a"),
        };
        assert!(check(&ev, "a", "u", SubscriptionScope::All, Visibility::Visible));
        assert!(!check(&ev, "b", "u", SubscriptionScope::All, Visibility::Visible));
    }

    #[test]
    fn message_events_go_to_exact_session_or_firehose() {
        let ev = message_event("ns", "s1");
        assert!(check(&ev, "ns", "u", SubscriptionScope::All, Visibility::Visible));
        assert!(check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s1".into()),
            Visibility::Visible
        ));
        assert!(!check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s2".into()),
            Visibility::Visible
        ));
        assert!(!check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Machine("m1".into()),
            Visibility::Visible
        ));
    }

    #[test]
    fn session_events_match_session_scope() {
        let ev = SyncEvent::SessionRemoved {
            namespace: "ns".into(),
            session_id: "s1".into(),
        };
        assert!(check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s1".into()),
            Visibility::Hidden
        ));
        assert!(!check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s2".into()),
            Visibility::Hidden
        ));
        assert!(!check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Machine("m1".into()),
            Visibility::Hidden
        ));
    }

    #[test]
    fn machine_events_match_machine_scope() {
        let ev = machine_event("ns", "m1");
        assert!(check(&ev, "ns", "u", SubscriptionScope::All, Visibility::Hidden));
        assert!(check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Machine("m1".into()),
            Visibility::Hidden
        ));
        assert!(!check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s1".into()),
            Visibility::Hidden
        ));
    }

    #[test]
    fn toast_requires_visible() {
        let ev = SyncEvent::Toast {
            namespace: "ns".into(),
            title: "t".into(),
            body: "b".into(),
            session_id: Some("s1".into()),
        };
        assert!(check(&ev, "ns", "u", SubscriptionScope::All, Visibility::Visible));
        assert!(!check(&ev, "ns", "u", SubscriptionScope::All, Visibility::Hidden));
        assert!(check(
            &ev,
            "ns",
            "u",
            SubscriptionScope::Session("s1".into()),
            Visibility::Visible
        ));
    }

    #[test]
    fn user_routed_events_match_user_only() {
        let ev = SyncEvent::SessionSortPreferenceUpdated {
            user_id: "u1".into(),
            value: json!("recent"),
        };
        assert!(check(&ev, "ns", "u1", SubscriptionScope::All, Visibility::Hidden));
        assert!(!check(&ev, "ns", "u2", SubscriptionScope::All, Visibility::Visible));
        // Scope does not matter for user-routed events.
        assert!(check(
            &ev,
            "other-ns",
            "u1",
            SubscriptionScope::Machine("m".into()),
            Visibility::Hidden
        ));
    }

    #[tokio::test]
    async fn dispatch_routes_and_overflow_closes() {
        let publisher = EventPublisher::new();
        let fanout = Arc::new(Fanout::new(publisher.clone(), Duration::from_secs(3600), 2));
        tokio::spawn(fanout.clone().run());

        let (all_id, mut all_rx) = fanout
            .subscribe("ns", "u1", SubscriptionScope::All, Visibility::Visible)
            .await;
        let (_other_id, mut other_rx) = fanout
            .subscribe("ns", "u2", SubscriptionScope::Session("elsewhere".into()), Visibility::Visible)
            .await;

        publisher.emit(message_event("ns", "s1"));

        // The firehose subscription sees it (after the connection-changed
        // presence events from the two subscribes).
        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match all_rx.recv().await {
                    Some(Outbound::Event(SyncEvent::MessageReceived { session_id, .. })) => {
                        break session_id;
                    }
                    Some(_) => continue,
                    None => panic!("subscription closed unexpectedly"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, "s1");

        // The mismatched scope never sees message traffic.
        let nothing = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match other_rx.recv().await {
                    Some(Outbound::Event(SyncEvent::MessageReceived { .. })) => break false,
                    Some(_) => continue,
                    None => break true,
                }
            }
        })
        .await;
        assert!(nothing.is_err() || nothing.unwrap());

        // Overflow: stop draining `all_rx` and flood past the capacity of 2.
        for _ in 0..10 {
            publisher.emit(message_event("ns", "s1"));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if fanout.subscription_count().await == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("overflowed subscription should have been closed");
        assert!(!fanout.set_visibility(&all_id, Visibility::Hidden).await);
    }

    #[tokio::test]
    async fn visibility_toggle_gates_toasts() {
        let publisher = EventPublisher::new();
        let fanout = Arc::new(Fanout::new(
            publisher.clone(),
            Duration::from_secs(3600),
            DEFAULT_QUEUE_CAPACITY,
        ));
        tokio::spawn(fanout.clone().run());

        let (id, mut rx) = fanout
            .subscribe("ns", "u1", SubscriptionScope::All, Visibility::Hidden)
            .await;

        publisher.emit(SyncEvent::Toast {
            namespace: "ns".into(),
            title: "quiet".into(),
            body: "b".into(),
            session_id: None,
        });
        // Marker event: once it arrives, the hidden toast has already been
        // processed (and filtered) by the bridge.
        publisher.emit(SyncEvent::SessionRemoved {
            namespace: "ns".into(),
            session_id: "marker".into(),
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(Outbound::Event(SyncEvent::SessionRemoved { .. })) => break,
                    Some(Outbound::Event(SyncEvent::Toast { .. })) => {
                        panic!("hidden subscription received a toast")
                    }
                    Some(_) => continue,
                    None => panic!("subscription closed unexpectedly"),
                }
            }
        })
        .await
        .unwrap();

        fanout.set_visibility(&id, Visibility::Visible).await;
        publisher.emit(SyncEvent::Toast {
            namespace: "ns".into(),
            title: "loud".into(),
            body: "b".into(),
            session_id: None,
        });

        let first_toast = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(Outbound::Event(SyncEvent::Toast { title, .. })) => break title,
                    Some(_) => continue,
                    None => panic!("subscription closed unexpectedly"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(first_toast, "loud");
    }
}
