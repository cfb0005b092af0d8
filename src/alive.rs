//! Periodic liveness sweep.
//!
//! Demotes sessions and machines whose heartbeats lapsed and cancels
//! permission requests that outlived the decision timeout. Operates on
//! cached state only; failures are logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::machine::MachineCache;
use crate::permissions::PermissionBroker;
use crate::session::SessionCache;
use crate::storage::now_ms;

pub fn spawn(
    sessions: Arc<SessionCache>,
    machines: Arc<MachineCache>,
    broker: Arc<PermissionBroker>,
    sweep_interval: Duration,
    permission_timeout_ms: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = now_ms();

            match sessions.expire_inactive(now).await {
                Ok(n) if n > 0 => debug!(demoted = n, "sessions demoted to inactive"),
                Ok(_) => {}
                Err(e) => warn!(err = %e, "session liveness sweep failed"),
            }

            match machines.expire_inactive(now).await {
                Ok(n) if n > 0 => debug!(demoted = n, "machines demoted to inactive"),
                Ok(_) => {}
                Err(e) => warn!(err = %e, "machine liveness sweep failed"),
            }

            match broker.expire_older_than(now - permission_timeout_ms).await {
                Ok(n) if n > 0 => debug!(expired = n, "permission requests timed out"),
                Ok(_) => {}
                Err(e) => warn!(err = %e, "permission timeout sweep failed"),
            }
        }
    })
}
