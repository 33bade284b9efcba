//! Background expiry sweep
//!
//! Reads already treat expired entries as absent, but an expired key that is
//! never read again would stay in memory forever. The sweeper wakes on a fixed
//! interval and removes every expired entry under the store's lock.

use crate::store::{purge_expired, EntryMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running sweep task
///
/// Dropping the handle signals the task to stop; `stop` also waits for it.
#[derive(Debug)]
pub(crate) struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Spawn the sweep task on the current Tokio runtime
    pub fn start(entries: Arc<Mutex<EntryMap>>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = interval.max(MIN_INTERVAL);
        let handle = tokio::spawn(sweep_loop(entries, interval, shutdown_rx));

        debug!(interval_ms = interval.as_millis() as u64, "Expiry sweeper started");

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and wait until it has exited
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Expiry sweeper task failed: {}", e);
            }
        }
        debug!("Expiry sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn sweep_loop(
    entries: Arc<Mutex<EntryMap>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let removed = {
            let mut entries = entries.lock().await;
            purge_expired(&mut entries, Instant::now())
        };

        if removed > 0 {
            debug!(removed, "Swept expired keys");
        }
    }
}
