//! Background expiry of idle transport sessions.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::SessionService;

/// Spawn a task that calls [`SessionService::expire_transport_sessions`]
/// every `period` until `cancel` fires.
///
/// Expiry may block on session locks, so each sweep runs on the blocking pool.
pub fn spawn_reaper(service: SessionService, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick.

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let svc = service.clone();
                    match tokio::task::spawn_blocking(move || svc.expire_transport_sessions(Instant::now())).await {
                        Ok(0) => {}
                        Ok(expired) => tracing::debug!(expired, "reaper sweep finished"),
                        Err(e) => tracing::error!(error = %e, "reaper sweep panicked"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("reaper stopped");
    })
}
