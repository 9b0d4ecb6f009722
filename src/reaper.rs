//! Background sweep that reclaims idle sessions.

use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweep `sessions` every `every` until `cancel` fires.
pub async fn run(sessions: Arc<SessionRegistry>, every: Duration, cancel: CancellationToken) {
    // First sweep one interval in; nothing can be idle at startup.
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = sessions.reap_idle().await;
                if report.reaped > 0 {
                    info!(reaped = report.reaped, deferred = report.deferred, "Reaped idle sessions");
                }
            }
        }
    }
    debug!("Reaper stopped");
}
