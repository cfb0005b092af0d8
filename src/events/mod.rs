use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::machine::MachineView;
use crate::messages::MessageView;
use crate::session::SessionView;

/// Typed event emitted after every confirmed cache mutation.
///
/// `connection-changed` and `session-sort-preference-updated` are routed by
/// target user; everything else carries the owning `namespace`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    SessionAdded {
        namespace: String,
        session: SessionView,
    },
    /// Full session snapshot after any state change.
    SessionUpdated {
        namespace: String,
        session: SessionView,
    },
    SessionRemoved {
        namespace: String,
        session_id: String,
    },
    MessageReceived {
        namespace: String,
        session_id: String,
        message: MessageView,
    },
    MachineUpdated {
        namespace: String,
        machine: MachineView,
    },
    ConnectionChanged {
        user_id: String,
        connected: bool,
    },
    SessionSortPreferenceUpdated {
        user_id: String,
        value: Value,
    },
    /// User-visible notification; delivered only to foregrounded clients.
    Toast {
        namespace: String,
        title: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl SyncEvent {
    /// Namespace used for routing, when the event has one.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            SyncEvent::SessionAdded { namespace, .. }
            | SyncEvent::SessionUpdated { namespace, .. }
            | SyncEvent::SessionRemoved { namespace, .. }
            | SyncEvent::MessageReceived { namespace, .. }
            | SyncEvent::MachineUpdated { namespace, .. }
            | SyncEvent::Toast { namespace, .. } => Some(namespace),
            SyncEvent::ConnectionChanged { .. }
            | SyncEvent::SessionSortPreferenceUpdated { .. } => None,
        }
    }

    /// Target user for the user-routed events.
    pub fn target_user(&self) -> Option<&str> {
        match self {
            SyncEvent::ConnectionChanged { user_id, .. }
            | SyncEvent::SessionSortPreferenceUpdated { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    /// Session the event is about, when scoped to one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SyncEvent::SessionAdded { session, .. }
            | SyncEvent::SessionUpdated { session, .. } => Some(&session.id),
            SyncEvent::SessionRemoved { session_id, .. }
            | SyncEvent::MessageReceived { session_id, .. } => Some(session_id),
            SyncEvent::Toast { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Machine the event is about, when scoped to one.
    pub fn machine_id(&self) -> Option<&str> {
        match self {
            SyncEvent::MachineUpdated { machine, .. } => Some(&machine.id),
            _ => None,
        }
    }
}

/// Broadcasts `SyncEvent`s to every live receiver.
///
/// `emit` enqueues to all current receivers in call order and never blocks.
/// There is no retention: a receiver that lags past the channel capacity
/// observes `Lagged` and must catch up through the paginated read paths.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Emit to all subscribers. No subscribers is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let p = EventPublisher::new();
        p.emit(SyncEvent::SessionRemoved {
            namespace: "ns".into(),
            session_id: "s1".into(),
        });
    }

    #[tokio::test]
    async fn subscribers_see_events_in_emit_order() {
        let p = EventPublisher::new();
        let mut rx = p.subscribe();
        for i in 0..3 {
            p.emit(SyncEvent::SessionRemoved {
                namespace: "ns".into(),
                session_id: format!("s{i}"),
            });
        }
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                SyncEvent::SessionRemoved { session_id, .. } => {
                    assert_eq!(session_id, format!("s{i}"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn wire_shape_is_kebab_tagged() {
        let ev = SyncEvent::SessionRemoved {
            namespace: "ns".into(),
            session_id: "s1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "session-removed");
        assert_eq!(json["sessionId"], "s1");
    }
}
