//! Periodic reaper for time-limited memberships.

use crate::data::InvalidationTask;
use crate::invalidator::AsyncCacheInvalidator;
use crate::store::PermissionStore;
use crate::utils::now_unix;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wakes on a fixed interval, deletes memberships whose expiry has
/// passed, and queues a targeted invalidation for every affected player.
pub struct ExpirySweeper {
    store: Arc<PermissionStore>,
    invalidator: Arc<AsyncCacheInvalidator>,
    interval: Duration,
    running: AtomicBool,
    gate: Mutex<()>,
    stop_signal: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<PermissionStore>,
        invalidator: Arc<AsyncCacheInvalidator>,
        interval: Duration,
    ) -> Self {
        ExpirySweeper {
            store,
            invalidator,
            interval,
            running: AtomicBool::new(false),
            gate: Mutex::new(()),
            stop_signal: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("sweeper: already running");
            return;
        }
        let this = Arc::clone(self);
        *self.worker.lock().unwrap() = Some(thread::spawn(move || this.run()));
        info!("sweeper: started, interval {:?}", self.interval);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("sweeper: already stopped");
            return;
        }
        self.stop_signal.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        info!("sweeper: stopped");
    }

    fn run(&self) {
        debug!("sweeper: worker started");
        while self.running.load(Ordering::SeqCst) {
            self.sweep_once();
            let gate = self.gate.lock().unwrap();
            let _ = self
                .stop_signal
                .wait_timeout_while(gate, self.interval, |_| {
                    self.running.load(Ordering::SeqCst)
                })
                .unwrap();
        }
        debug!("sweeper: worker exiting");
    }

    /// One reap pass. Also callable directly for an on-demand cleanup.
    pub fn sweep_once(&self) {
        match self.store.delete_expired_player_groups(now_unix()) {
            Ok(affected) if affected.is_empty() => {
                debug!("sweeper: nothing expired");
            }
            Ok(affected) => {
                debug!("sweeper: {} players lost expired memberships", affected.len());
                for player_uuid in affected {
                    self.invalidator
                        .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid));
                }
            }
            Err(err) => error!("sweeper: reap failed: {err}"),
        }
    }
}
