//! Hand-off point to the external web-push service.
//!
//! The hub records push subscriptions and decides *when* to notify; actual
//! delivery belongs to an external collaborator behind this trait. The
//! built-in implementation only logs, which keeps the hub self-contained in
//! development and tests.

use async_trait::async_trait;
use tracing::debug;

use crate::storage::PushSubscriptionRow;

#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn notify(&self, subscription: &PushSubscriptionRow, title: &str, body: &str);
}

/// Logs deliveries instead of calling a push provider.
#[derive(Default)]
pub struct LogPushDelivery;

#[async_trait]
impl PushDelivery for LogPushDelivery {
    async fn notify(&self, subscription: &PushSubscriptionRow, title: &str, body: &str) {
        debug!(
            endpoint = %subscription.endpoint,
            user = %subscription.user_id,
            title,
            body,
            "push notification handed off"
        );
    }
}
