//! Background lease expiry sweep.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::session::SessionManager;

/// Handle of a running reaper task.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stops the reaper and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            debug!("Session reaper task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns a task calling [`SessionManager::reap_expired`] every `interval`.
///
/// The task only holds a weak reference, so it also ends once the manager is
/// dropped, or when the returned handle is dropped. Must be called from within
/// a tokio runtime.
pub fn spawn_reaper(manager: &Arc<SessionManager>, interval: Duration) -> ReaperHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let manager: Weak<SessionManager> = Arc::downgrade(manager);
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let stats = manager.reap_expired();
            if stats.sessions > 0 || stats.clients > 0 {
                info!(
                    "Reaper removed {} session(s) and {} client(s)",
                    stats.sessions, stats.clients
                );
            }
        }
        debug!("Session reaper stopped");
    });
    ReaperHandle { shutdown, task }
}
