//! Asynchronous cache invalidation pipeline.
//!
//! Writers enqueue coarse-grained tasks; a bounded worker pool drains
//! them and walks the affected slice of the cache. Duplicate pending
//! tasks coalesce: the one outstanding task observes the latest store
//! state when it runs, so dropped duplicates lose nothing.
//!
//! Lock discipline: the queue mutex and the pending-set mutex are never
//! held at the same time, from producers or consumers.

use crate::cache::PermissionCache;
use crate::data::InvalidationTask;
use crate::store::PermissionStore;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct PendingTasks {
    groups: FxHashSet<String>,
    players: FxHashSet<String>,
    all_groups: bool,
    all_players: bool,
}

impl PendingTasks {
    /// Marks the task pending. `false` means an equivalent task is
    /// already outstanding and this one should be dropped.
    fn mark(&mut self, task: &InvalidationTask) -> bool {
        match task {
            InvalidationTask::GroupModified(group) => {
                !self.all_groups && self.groups.insert(group.clone())
            }
            InvalidationTask::PlayerGroupChanged(player) => self.players.insert(player.clone()),
            InvalidationTask::AllGroupsModified => {
                if self.all_groups {
                    false
                } else {
                    // The global pass subsumes every queued per-group task.
                    self.groups.clear();
                    self.all_groups = true;
                    true
                }
            }
            InvalidationTask::AllPlayersModified => {
                if self.all_players {
                    false
                } else {
                    self.all_players = true;
                    true
                }
            }
            InvalidationTask::Shutdown => true,
        }
    }

    /// Un-marks at dequeue time, not completion time, so a write racing
    /// with the running task re-enqueues a fresh pass.
    fn unmark(&mut self, task: &InvalidationTask) {
        match task {
            InvalidationTask::GroupModified(group) => {
                self.groups.remove(group);
            }
            InvalidationTask::PlayerGroupChanged(player) => {
                self.players.remove(player);
            }
            InvalidationTask::AllGroupsModified => self.all_groups = false,
            InvalidationTask::AllPlayersModified => self.all_players = false,
            InvalidationTask::Shutdown => {}
        }
    }
}

pub struct AsyncCacheInvalidator {
    cache: Arc<PermissionCache>,
    store: Arc<PermissionStore>,
    queue: Mutex<VecDeque<InvalidationTask>>,
    available: Condvar,
    pending: Mutex<PendingTasks>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncCacheInvalidator {
    pub fn new(cache: Arc<PermissionCache>, store: Arc<PermissionStore>) -> Self {
        AsyncCacheInvalidator {
            cache,
            store,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            pending: Mutex::new(PendingTasks::default()),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(self: &Arc<Self>, pool_size: usize) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("invalidator: already running");
            return;
        }
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..pool_size {
            let this = Arc::clone(self);
            workers.push(thread::spawn(move || this.worker_loop()));
        }
        info!("invalidator: started with {pool_size} workers");
    }

    /// Queued tasks are discarded; in-flight tasks complete. Each worker
    /// receives one shutdown marker and is joined.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("invalidator: already stopped");
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        {
            let mut queue = self.queue.lock().unwrap();
            let discarded = queue.len();
            queue.clear();
            if discarded > 0 {
                debug!("invalidator: discarded {discarded} queued tasks on stop");
            }
            for _ in 0..workers.len() {
                queue.push_back(InvalidationTask::Shutdown);
            }
        }
        self.available.notify_all();
        *self.pending.lock().unwrap() = PendingTasks::default();
        for worker in workers {
            let _ = worker.join();
        }
        info!("invalidator: stopped");
    }

    pub fn enqueue(&self, task: InvalidationTask) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("invalidator: not running, dropping {task:?}");
            return;
        }
        let fresh = self.pending.lock().unwrap().mark(&task);
        if !fresh {
            debug!("invalidator: coalesced {task:?}");
            return;
        }
        if self.workers.lock().unwrap().is_empty() {
            // Zero-width pool: run synchronously on the caller. Used by
            // deployments (and tests) that want writes to be visible
            // immediately after the mutating call returns.
            self.pending.lock().unwrap().unmark(&task);
            self.run_task(task);
            return;
        }
        self.queue.lock().unwrap().push_back(task);
        self.available.notify_one();
    }

    fn worker_loop(&self) {
        debug!("invalidator: worker started");
        loop {
            let task = {
                let mut queue = self.queue.lock().unwrap();
                while queue.is_empty() {
                    queue = self.available.wait(queue).unwrap();
                }
                queue.pop_front().unwrap()
            };
            if matches!(task, InvalidationTask::Shutdown) {
                break;
            }
            self.pending.lock().unwrap().unmark(&task);
            self.run_task(task);
        }
        debug!("invalidator: worker exiting");
    }

    fn run_task(&self, task: InvalidationTask) {
        match task {
            InvalidationTask::GroupModified(group) => self.invalidate_group_tree(&group),
            InvalidationTask::PlayerGroupChanged(player) => {
                self.cache.invalidate_player_rules(&player);
                self.cache.invalidate_player_groups(&player);
            }
            InvalidationTask::AllGroupsModified => {
                self.cache.invalidate_all_group_rules();
                self.cache.invalidate_all_player_rules();
            }
            InvalidationTask::AllPlayersModified => {
                self.cache.invalidate_all_player_rules();
            }
            InvalidationTask::Shutdown => {}
        }
    }

    /// A modified group invalidates itself, every descendant, and every
    /// member of those groups. Member lookup is two batched queries:
    /// names to ids, then ids to the distinct player set.
    fn invalidate_group_tree(&self, group: &str) {
        let affected = self.cache.descendants(group);
        debug!(
            "invalidator: group '{group}' modified, {} groups affected",
            affected.len()
        );
        for name in &affected {
            self.cache.invalidate_group_rules(name);
        }

        let ids = match self.store.fetch_group_ids_by_names(&affected) {
            Ok(map) => map.into_values().collect::<Vec<String>>(),
            Err(err) => {
                error!("invalidator: id lookup for '{group}' failed: {err}");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        match self.store.fetch_players_in_groups(&ids) {
            Ok(players) => {
                debug!(
                    "invalidator: invalidating {} players of '{group}'",
                    players.len()
                );
                for player in players {
                    self.cache.invalidate_player_rules(&player);
                    self.cache.invalidate_player_groups(&player);
                }
            }
            Err(err) => error!("invalidator: member lookup for '{group}' failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_group_tasks_coalesce() {
        let mut pending = PendingTasks::default();
        let task = InvalidationTask::GroupModified("g".into());
        assert!(pending.mark(&task));
        for _ in 0..1000 {
            assert!(!pending.mark(&task));
        }
        // Dequeue releases the slot for the next writer.
        pending.unmark(&task);
        assert!(pending.mark(&task));
    }

    #[test]
    fn all_groups_subsumes_pending_group_tasks() {
        let mut pending = PendingTasks::default();
        assert!(pending.mark(&InvalidationTask::GroupModified("a".into())));
        assert!(pending.mark(&InvalidationTask::GroupModified("b".into())));
        assert!(pending.mark(&InvalidationTask::AllGroupsModified));
        // Per-group tasks arriving while the global pass is pending drop.
        assert!(!pending.mark(&InvalidationTask::GroupModified("a".into())));
        assert!(!pending.mark(&InvalidationTask::GroupModified("c".into())));
        assert!(!pending.mark(&InvalidationTask::AllGroupsModified));

        pending.unmark(&InvalidationTask::AllGroupsModified);
        assert!(pending.mark(&InvalidationTask::GroupModified("c".into())));
    }

    #[test]
    fn player_tasks_coalesce_per_player() {
        let mut pending = PendingTasks::default();
        assert!(pending.mark(&InvalidationTask::PlayerGroupChanged("u1".into())));
        assert!(!pending.mark(&InvalidationTask::PlayerGroupChanged("u1".into())));
        assert!(pending.mark(&InvalidationTask::PlayerGroupChanged("u2".into())));
    }
}
