//! Dead-connection reaper.
//!
//! A background task that sweeps the connection registry on a fixed
//! interval. Each sweep takes the connections lock once and evicts every
//! connection that has gone DISCONNECTED, closing it first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ConnectionList;

/// Handle to a running reaper task.
pub(crate) struct Reaper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Spawns the reaper. The first sweep runs immediately.
    pub(crate) fn spawn(connections: ConnectionList, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("Reaper stopping");
                        break;
                    }

                    _ = ticker.tick() => {}
                }

                // Outside the select so a stop request never interrupts a sweep
                let reaped = reap_dead(&connections).await;
                if reaped > 0 {
                    debug!(reaped, "Evicted dead connections");
                }
            }
        });

        Self { cancel, task }
    }

    /// Requests a stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stops the reaper and waits for its task to finish.
    pub(crate) async fn stop(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

/// Closes and removes every disconnected connection under one lock acquisition.
///
/// Returns the number of connections evicted.
pub(crate) async fn reap_dead(connections: &ConnectionList) -> usize {
    let mut connections = connections.lock().await;
    let mut reaped = 0;

    while let Some(index) = connections.iter().position(|c| !c.is_connected()) {
        let connection = Arc::clone(&connections[index]);
        if let Err(e) = connection.close().await {
            warn!(peer = %connection.peer(), error = %e, "Failed to close dead connection");
        }
        connections.remove(index);
        reaped += 1;
    }

    reaped
}
