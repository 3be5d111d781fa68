//! Public façade over the permission authority.
//!
//! One process-wide instance orchestrates the store, cache, invalidator
//! and sweeper. Lifecycle runs `uninitialized -> running -> shut down`;
//! the store handle is injected at `init` rather than construction so a
//! host can pick the database engine at startup.
//!
//! No method returns an error: lookups yield empty collections for
//! unknown names and mutations report `bool`, with failures logged.

use crate::cache::PermissionCache;
use crate::data::{CompiledRule, GroupDetails, InvalidationTask};
use crate::events::{PermissionEvent, PermissionEventBus};
use crate::invalidator::AsyncCacheInvalidator;
use crate::rules;
use crate::store::PermissionStore;
use crate::sweeper::ExpirySweeper;
use crate::utils::now_unix;
use authority_db::{DatabaseDriver, DbError};
use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

static INSTANCE: Lazy<PermissionManager> = Lazy::new(PermissionManager::new);

enum ManagerState {
    Uninitialized,
    Running(Arc<ManagerInner>),
    ShutDown,
}

pub struct PermissionManager {
    state: RwLock<ManagerState>,
    events: PermissionEventBus,
}

struct ManagerInner {
    store: Arc<PermissionStore>,
    cache: Arc<PermissionCache>,
    invalidator: Arc<AsyncCacheInvalidator>,
    sweeper: Arc<ExpirySweeper>,
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionManager {
    /// The process-wide instance. Hosts that want an isolated manager
    /// (tests do) can construct their own with [`PermissionManager::new`].
    pub fn instance() -> &'static PermissionManager {
        &INSTANCE
    }

    pub fn new() -> Self {
        PermissionManager {
            state: RwLock::new(ManagerState::Uninitialized),
            events: PermissionEventBus::new(),
        }
    }

    pub fn events(&self) -> &PermissionEventBus {
        &self.events
    }

    fn inner(&self) -> Option<Arc<ManagerInner>> {
        match &*self.state.read().unwrap() {
            ManagerState::Running(inner) => Some(Arc::clone(inner)),
            ManagerState::Uninitialized => {
                warn!("permission manager used before init");
                None
            }
            ManagerState::ShutDown => {
                warn!("permission manager used after shutdown");
                None
            }
        }
    }

    // --- lifecycle ---

    /// Bootstraps the schema, loads the structural projection (group
    /// names, inheritance, defaults), optionally precompiles every
    /// group's rule set, then starts the invalidator pool and the
    /// expiry sweeper.
    ///
    /// `thread_pool_size` of zero makes invalidation synchronous on the
    /// writing thread.
    pub fn init(
        &self,
        driver: Arc<dyn DatabaseDriver>,
        enable_warmup: bool,
        thread_pool_size: usize,
        sweeper_interval: Duration,
    ) -> bool {
        let mut state = self.state.write().unwrap();
        match &*state {
            ManagerState::Running(_) => {
                warn!("permission manager already initialized");
                return true;
            }
            ManagerState::ShutDown => {
                warn!("permission manager cannot be re-initialized after shutdown");
                return false;
            }
            ManagerState::Uninitialized => {}
        }

        let store = Arc::new(PermissionStore::new(driver));
        if let Err(err) = store.ensure_tables() {
            error!("permission manager init failed: schema bootstrap: {err}");
            return false;
        }
        let cache = Arc::new(PermissionCache::default());
        let invalidator = Arc::new(AsyncCacheInvalidator::new(
            Arc::clone(&cache),
            Arc::clone(&store),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&invalidator),
            sweeper_interval,
        ));
        let inner = Arc::new(ManagerInner {
            store,
            cache,
            invalidator,
            sweeper,
        });

        if let Err(err) = inner.load_projection() {
            error!("permission manager init failed: cache projection: {err}");
            return false;
        }
        if enable_warmup {
            inner.warm_group_rules();
        }
        inner.invalidator.start(thread_pool_size);
        inner.sweeper.start();
        *state = ManagerState::Running(inner);
        info!("permission manager initialized");
        true
    }

    /// Stops the sweeper and the invalidator and joins their threads.
    /// The manager is terminal afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap();
        match std::mem::replace(&mut *state, ManagerState::ShutDown) {
            ManagerState::Running(inner) => {
                inner.sweeper.stop();
                inner.invalidator.stop();
                info!("permission manager shut down");
            }
            previous => {
                *state = previous;
                warn!("shutdown called without a running permission manager");
            }
        }
    }

    /// Immediate reap pass, outside the sweeper's timer.
    pub fn run_periodic_cleanup(&self) {
        if let Some(inner) = self.inner() {
            inner.sweeper.sweep_once();
        }
    }

    // --- permissions ---

    /// Registers or updates a permission node. Re-registering updates
    /// the description and default in place.
    pub fn register_permission(&self, name: &str, description: &str, default_value: bool) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        match inner.store.upsert_permission(name, description, default_value) {
            Ok(()) => {
                inner.cache.store_permission_default(name, default_value);
                // A changed default can affect any compiled rule set.
                inner.invalidator.enqueue(InvalidationTask::AllGroupsModified);
                inner.invalidator.enqueue(InvalidationTask::AllPlayersModified);
                true
            }
            Err(err) => {
                error!("register_permission '{name}' failed: {err}");
                false
            }
        }
    }

    pub fn permission_exists(&self, name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        inner.store.permission_exists(name).unwrap_or_else(|err| {
            error!("permission_exists '{name}' failed: {err}");
            false
        })
    }

    pub fn all_permissions(&self) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner.store.fetch_all_permission_names().unwrap_or_else(|err| {
            error!("all_permissions failed: {err}");
            Vec::new()
        })
    }

    // --- groups ---

    pub fn create_group(&self, group_name: &str, description: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        match inner.store.create_group(group_name, description) {
            Ok(Some(group_id)) => {
                inner.cache.store_group(group_name, &group_id);
                // A new group has no rules and no members yet; nothing
                // to invalidate.
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!("create_group '{group_name}' failed: {err}");
                false
            }
        }
    }

    pub fn delete_group(&self, group_name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        // Capture the fan-out before the edges disappear.
        let descendants = inner.cache.descendants(group_name);
        match inner.store.delete_group(&group_id) {
            Ok(true) => {
                inner.cache.invalidate_group(group_name);
                inner.cache.remove_group_edges(group_name);
                for descendant in descendants {
                    inner
                        .invalidator
                        .enqueue(InvalidationTask::GroupModified(descendant));
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("delete_group '{group_name}' failed: {err}");
                false
            }
        }
    }

    pub fn group_exists(&self, group_name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        inner.cached_group_id(group_name).is_some()
    }

    pub fn all_groups(&self) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner.store.fetch_all_group_names().unwrap_or_else(|err| {
            error!("all_groups failed: {err}");
            Vec::new()
        })
    }

    pub fn group_details(&self, group_name: &str) -> Option<GroupDetails> {
        let inner = self.inner()?;
        inner.store.fetch_group_details(group_name).unwrap_or_else(|err| {
            error!("group_details '{group_name}' failed: {err}");
            None
        })
    }

    pub fn update_group_description(&self, group_name: &str, description: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        if inner.cached_group_id(group_name).is_none() {
            return false;
        }
        match inner.store.update_group_description(group_name, description) {
            Ok(()) => true,
            Err(err) => {
                error!("update_group_description '{group_name}' failed: {err}");
                false
            }
        }
    }

    pub fn group_description(&self, group_name: &str) -> String {
        let Some(inner) = self.inner() else {
            return String::new();
        };
        inner
            .store
            .fetch_group_description(group_name)
            .unwrap_or_else(|err| {
                error!("group_description '{group_name}' failed: {err}");
                None
            })
            .unwrap_or_default()
    }

    pub fn set_group_priority(&self, group_name: &str, priority: i32) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        if inner.cached_group_id(group_name).is_none() {
            return false;
        }
        match inner.store.update_group_priority(group_name, priority) {
            Ok(()) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                true
            }
            Err(err) => {
                error!("set_group_priority '{group_name}' failed: {err}");
                false
            }
        }
    }

    pub fn group_priority(&self, group_name: &str) -> i32 {
        let Some(inner) = self.inner() else {
            return 0;
        };
        inner.store.fetch_group_priority(group_name).unwrap_or_else(|err| {
            error!("group_priority '{group_name}' failed: {err}");
            0
        })
    }

    // --- group rules ---

    pub fn add_permission_to_group(&self, group_name: &str, rule: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let event = PermissionEvent::GroupPermissionChange {
            group_name: group_name.to_owned(),
            rule: rule.to_owned(),
            added: true,
        };
        if !self.events.publish_before(&event) {
            return false;
        }
        match inner.store.add_permission_to_group(&group_id, rule) {
            Ok(()) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                self.events.publish_after(event);
                true
            }
            Err(err) => {
                error!("add_permission_to_group '{group_name}' <- '{rule}' failed: {err}");
                false
            }
        }
    }

    pub fn remove_permission_from_group(&self, group_name: &str, rule: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let event = PermissionEvent::GroupPermissionChange {
            group_name: group_name.to_owned(),
            rule: rule.to_owned(),
            added: false,
        };
        if !self.events.publish_before(&event) {
            return false;
        }
        match inner.store.remove_permission_from_group(&group_id, rule) {
            Ok(true) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                self.events.publish_after(event);
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("remove_permission_from_group '{group_name}' -> '{rule}' failed: {err}");
                false
            }
        }
    }

    /// Batch rule grant. Each rule publishes its own before-event; a
    /// cancelled rule is skipped, the rest proceed. Returns how many
    /// rules were newly persisted.
    pub fn add_permissions_to_group(&self, group_name: &str, permission_rules: &[String]) -> usize {
        let Some(inner) = self.inner() else {
            return 0;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return 0;
        };
        let mut permitted = Vec::new();
        for rule in permission_rules {
            let event = PermissionEvent::GroupPermissionChange {
                group_name: group_name.to_owned(),
                rule: rule.clone(),
                added: true,
            };
            if self.events.publish_before(&event) {
                permitted.push((rule.clone(), event));
            }
        }
        let rules: Vec<String> = permitted.iter().map(|(rule, _)| rule.clone()).collect();
        match inner.store.add_permissions_to_group(&group_id, &rules) {
            Ok(count) => {
                if count > 0 {
                    inner
                        .invalidator
                        .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                }
                for (_, event) in permitted {
                    self.events.publish_after(event);
                }
                count
            }
            Err(err) => {
                error!("add_permissions_to_group '{group_name}' failed: {err}");
                0
            }
        }
    }

    pub fn remove_permissions_from_group(
        &self,
        group_name: &str,
        permission_rules: &[String],
    ) -> usize {
        let Some(inner) = self.inner() else {
            return 0;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return 0;
        };
        let mut permitted = Vec::new();
        for rule in permission_rules {
            let event = PermissionEvent::GroupPermissionChange {
                group_name: group_name.to_owned(),
                rule: rule.clone(),
                added: false,
            };
            if self.events.publish_before(&event) {
                permitted.push((rule.clone(), event));
            }
        }
        let rules: Vec<String> = permitted.iter().map(|(rule, _)| rule.clone()).collect();
        match inner.store.remove_permissions_from_group(&group_id, &rules) {
            Ok(count) => {
                if count > 0 {
                    inner
                        .invalidator
                        .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                }
                for (_, event) in permitted {
                    self.events.publish_after(event);
                }
                count
            }
            Err(err) => {
                error!("remove_permissions_from_group '{group_name}' failed: {err}");
                0
            }
        }
    }

    pub fn direct_permissions_of_group(&self, group_name: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return Vec::new();
        };
        inner
            .store
            .fetch_direct_permissions_of_group(&group_id)
            .unwrap_or_else(|err| {
                error!("direct_permissions_of_group '{group_name}' failed: {err}");
                Vec::new()
            })
    }

    /// The effective rule set of the group's ancestor-closure, compiled
    /// and cached.
    pub fn permissions_of_group(&self, group_name: &str) -> Vec<CompiledRule> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner.effective_group_rules(group_name)
    }

    // --- inheritance ---

    /// Rejects self-inheritance and any edge that would close a cycle.
    pub fn add_group_inheritance(&self, group_name: &str, parent_name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        if group_name == parent_name || inner.cache.has_path(group_name, parent_name) {
            warn!("inheritance '{group_name}' <- '{parent_name}' rejected: cycle");
            return false;
        }
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let Some(parent_id) = inner.cached_group_id(parent_name) else {
            return false;
        };
        match inner.store.add_group_inheritance(&group_id, &parent_id) {
            Ok(()) => {
                inner.cache.add_inheritance(group_name, parent_name);
                inner
                    .invalidator
                    .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                true
            }
            Err(err) => {
                error!("add_group_inheritance '{group_name}' <- '{parent_name}' failed: {err}");
                false
            }
        }
    }

    pub fn remove_group_inheritance(&self, group_name: &str, parent_name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let Some(parent_id) = inner.cached_group_id(parent_name) else {
            return false;
        };
        match inner.store.remove_group_inheritance(&group_id, &parent_id) {
            Ok(true) => {
                inner.cache.remove_inheritance(group_name, parent_name);
                inner
                    .invalidator
                    .enqueue(InvalidationTask::GroupModified(group_name.to_owned()));
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("remove_group_inheritance '{group_name}' <- '{parent_name}' failed: {err}");
                false
            }
        }
    }

    /// Every group the given group inherits from, transitively. The
    /// group itself is not part of the answer.
    pub fn all_ancestor_groups(&self, group_name: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        let mut ancestors = inner.cache.all_ancestors(group_name);
        ancestors.remove(group_name);
        ancestors.into_iter().collect()
    }

    pub fn direct_parent_groups(&self, group_name: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return Vec::new();
        };
        let parent_ids = match inner.store.fetch_direct_parent_group_ids(&group_id) {
            Ok(ids) => ids,
            Err(err) => {
                error!("direct_parent_groups '{group_name}' failed: {err}");
                return Vec::new();
            }
        };
        let id_to_name = inner
            .store
            .fetch_group_names_by_ids(&parent_ids)
            .unwrap_or_else(|err| {
                error!("direct_parent_groups '{group_name}' name lookup failed: {err}");
                FxHashMap::default()
            });
        parent_ids
            .iter()
            .filter_map(|id| id_to_name.get(id).cloned())
            .collect()
    }

    // --- memberships ---

    /// Grants membership, replacing any existing grant for the same
    /// group. `duration_seconds` of `None` or anything non-positive
    /// means permanent.
    pub fn add_player_to_group(
        &self,
        player_uuid: &str,
        group_name: &str,
        duration_seconds: Option<i64>,
    ) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let expiry_timestamp = duration_seconds
            .filter(|duration| *duration > 0)
            .map(|duration| now_unix() + duration);
        let event = PermissionEvent::PlayerJoinGroup {
            player_uuid: player_uuid.to_owned(),
            group_name: group_name.to_owned(),
            expiry_timestamp,
        };
        if !self.events.publish_before(&event) {
            return false;
        }
        match inner
            .store
            .add_player_to_group(player_uuid, &group_id, expiry_timestamp)
        {
            Ok(()) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid.to_owned()));
                self.events.publish_after(event);
                true
            }
            Err(err) => {
                error!("add_player_to_group '{player_uuid}' -> '{group_name}' failed: {err}");
                false
            }
        }
    }

    pub fn remove_player_from_group(&self, player_uuid: &str, group_name: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let event = PermissionEvent::PlayerLeaveGroup {
            player_uuid: player_uuid.to_owned(),
            group_name: group_name.to_owned(),
        };
        if !self.events.publish_before(&event) {
            return false;
        }
        match inner.store.remove_player_from_group(player_uuid, &group_id) {
            Ok(true) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid.to_owned()));
                self.events.publish_after(event);
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("remove_player_from_group '{player_uuid}' -> '{group_name}' failed: {err}");
                false
            }
        }
    }

    /// Batch membership grant (permanent, no events). Returns the number
    /// of groups the player newly joined.
    pub fn add_player_to_groups(&self, player_uuid: &str, group_names: &[String]) -> usize {
        let Some(inner) = self.inner() else {
            return 0;
        };
        let group_infos: Vec<(String, String)> = group_names
            .iter()
            .filter_map(|name| {
                inner
                    .cached_group_id(name)
                    .map(|id| (name.clone(), id))
            })
            .collect();
        match inner.store.add_player_to_groups(player_uuid, &group_infos) {
            Ok(count) => {
                if count > 0 {
                    inner
                        .invalidator
                        .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid.to_owned()));
                }
                count
            }
            Err(err) => {
                error!("add_player_to_groups '{player_uuid}' failed: {err}");
                0
            }
        }
    }

    pub fn remove_player_from_groups(&self, player_uuid: &str, group_names: &[String]) -> usize {
        let Some(inner) = self.inner() else {
            return 0;
        };
        let group_ids: Vec<String> = group_names
            .iter()
            .filter_map(|name| inner.cached_group_id(name))
            .collect();
        match inner.store.remove_player_from_groups(player_uuid, &group_ids) {
            Ok(count) => {
                if count > 0 {
                    inner
                        .invalidator
                        .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid.to_owned()));
                }
                count
            }
            Err(err) => {
                error!("remove_player_from_groups '{player_uuid}' failed: {err}");
                0
            }
        }
    }

    pub fn player_groups(&self, player_uuid: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner
            .player_groups_details(player_uuid)
            .into_iter()
            .map(|group| group.name)
            .collect()
    }

    pub fn player_group_ids(&self, player_uuid: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner
            .player_groups_details(player_uuid)
            .into_iter()
            .map(|group| group.id)
            .collect()
    }

    pub fn player_groups_with_priorities(&self, player_uuid: &str) -> Vec<GroupDetails> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner.player_groups_details(player_uuid)
    }

    pub fn players_in_group(&self, group_name: &str) -> Vec<String> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return Vec::new();
        };
        inner
            .store
            .fetch_players_in_group(&group_id)
            .unwrap_or_else(|err| {
                error!("players_in_group '{group_name}' failed: {err}");
                Vec::new()
            })
    }

    /// `None` both when the player is not in the group and when the
    /// membership is permanent.
    pub fn get_player_group_expiration_time(
        &self,
        player_uuid: &str,
        group_name: &str,
    ) -> Option<i64> {
        let inner = self.inner()?;
        inner
            .player_groups_details(player_uuid)
            .into_iter()
            .find(|group| group.name == group_name)
            .and_then(|group| group.expiration_time)
    }

    /// Re-times an existing membership; non-positive duration makes it
    /// permanent. Does not create the membership.
    pub fn set_player_group_expiration_time(
        &self,
        player_uuid: &str,
        group_name: &str,
        duration_seconds: i64,
    ) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let Some(group_id) = inner.cached_group_id(group_name) else {
            return false;
        };
        let expiry_timestamp = (duration_seconds > 0).then(|| now_unix() + duration_seconds);
        match inner
            .store
            .update_player_group_expiration_time(player_uuid, &group_id, expiry_timestamp)
        {
            Ok(true) => {
                inner
                    .invalidator
                    .enqueue(InvalidationTask::PlayerGroupChanged(player_uuid.to_owned()));
                true
            }
            Ok(false) => {
                warn!(
                    "set_player_group_expiration_time: '{player_uuid}' is not in '{group_name}'"
                );
                false
            }
            Err(err) => {
                error!(
                    "set_player_group_expiration_time '{player_uuid}' -> '{group_name}' failed: {err}"
                );
                false
            }
        }
    }

    // --- checks ---

    pub fn all_permissions_for_player(&self, player_uuid: &str) -> Vec<CompiledRule> {
        let Some(inner) = self.inner() else {
            return Vec::new();
        };
        inner.effective_player_rules(player_uuid)
    }

    /// The longest matching rule decides; otherwise the node's default;
    /// unregistered nodes are denied.
    pub fn has_permission(&self, player_uuid: &str, permission_node: &str) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        inner.has_permission(player_uuid, permission_node)
    }
}

impl ManagerInner {
    /// Name/id, inheritance and default tables are small; they are
    /// loaded unconditionally at init so inheritance queries are correct
    /// even without warmup.
    fn load_projection(&self) -> Result<(), DbError> {
        let names: FxHashSet<String> = self.store.fetch_all_group_names()?.into_iter().collect();
        let name_to_id = self.store.fetch_group_ids_by_names(&names)?;
        debug!("projection: {} groups", name_to_id.len());
        self.cache.populate_groups(name_to_id);

        let parent_to_children = self.store.fetch_all_inheritance()?;
        let mut child_to_parents: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for (parent, children) in &parent_to_children {
            for child in children {
                child_to_parents
                    .entry(child.clone())
                    .or_default()
                    .insert(parent.clone());
            }
        }
        self.cache
            .populate_inheritance(parent_to_children, child_to_parents);

        self.cache
            .populate_permission_defaults(self.store.fetch_all_permission_defaults()?);
        Ok(())
    }

    /// Warmup: precompile the effective rule set of every known group.
    fn warm_group_rules(&self) {
        let names = self.cache.group_names_snapshot();
        info!("warming compiled rules for {} groups", names.len());
        for name in names {
            self.effective_group_rules(&name);
        }
    }

    fn cached_group_id(&self, group_name: &str) -> Option<String> {
        if let Some(id) = self.cache.find_group_id(group_name) {
            return Some(id);
        }
        match self.store.fetch_group_id_by_name(group_name) {
            Ok(Some(id)) => {
                self.cache.store_group(group_name, &id);
                Some(id)
            }
            Ok(None) => {
                debug!("unknown group '{group_name}'");
                None
            }
            Err(err) => {
                error!("group id lookup for '{group_name}' failed: {err}");
                None
            }
        }
    }

    /// Defaults snapshot, loading from the store on first use.
    fn permission_defaults(&self) -> FxHashMap<String, bool> {
        let defaults = self.cache.permission_defaults_snapshot();
        if !defaults.is_empty() {
            return defaults;
        }
        match self.store.fetch_all_permission_defaults() {
            Ok(defaults) => {
                self.cache.populate_permission_defaults(defaults.clone());
                defaults
            }
            Err(err) => {
                error!("permission defaults load failed: {err}");
                FxHashMap::default()
            }
        }
    }

    fn player_groups_details(&self, player_uuid: &str) -> Vec<GroupDetails> {
        if let Some(groups) = self.cache.find_player_groups(player_uuid, now_unix()) {
            return groups;
        }
        match self
            .store
            .fetch_player_groups_with_details(player_uuid, now_unix())
        {
            Ok(groups) => {
                self.cache.store_player_groups(player_uuid, groups.clone());
                groups
            }
            Err(err) => {
                error!("player groups lookup for '{player_uuid}' failed: {err}");
                Vec::new()
            }
        }
    }

    /// Walks the ancestor-closure lowest priority first so higher
    /// priorities override, then compiles to matchers.
    fn effective_group_rules(&self, group_name: &str) -> Vec<CompiledRule> {
        if let Some(rules) = self.cache.find_group_rules(group_name) {
            return rules;
        }

        let ancestors = self.cache.all_ancestors(group_name);
        let details = match self.store.fetch_group_details_by_names(&ancestors) {
            Ok(details) => details,
            Err(err) => {
                error!("ancestor lookup for '{group_name}' failed: {err}");
                return Vec::new();
            }
        };
        let mut groups: Vec<GroupDetails> = details.into_values().collect();
        groups.sort_by_key(|group| group.priority);

        let mut effective: FxHashMap<String, bool> = FxHashMap::default();
        for group in &groups {
            let direct = match self.store.fetch_direct_permissions_of_group(&group.id) {
                Ok(direct) => direct,
                Err(err) => {
                    error!("rule lookup for '{}' failed: {err}", group.name);
                    continue;
                }
            };
            for rule in &direct {
                if let Some((base, state)) = rules::parse_rule(rule) {
                    effective.insert(base.to_owned(), state);
                }
            }
        }

        let compiled = rules::compile_rule_set(&effective);
        self.cache.store_group_rules(group_name, compiled.clone());
        compiled
    }

    /// Player resolution: defaults that grant seed the state, then every
    /// relevant group (memberships plus their ancestor-closures) applies
    /// its direct rules in priority order.
    fn effective_player_rules(&self, player_uuid: &str) -> Vec<CompiledRule> {
        if let Some(rules) = self.cache.find_player_rules(player_uuid) {
            return rules;
        }

        let mut effective: FxHashMap<String, bool> = FxHashMap::default();
        for (name, granted) in self.permission_defaults() {
            if granted {
                effective.insert(name, true);
            }
        }

        let memberships = self.player_groups_details(player_uuid);
        let mut relevant: FxHashSet<String> = FxHashSet::default();
        for group in &memberships {
            relevant.extend(self.cache.all_ancestors(&group.name));
        }

        let details = match self.store.fetch_group_details_by_names(&relevant) {
            Ok(details) => details,
            Err(err) => {
                error!("group lookup for '{player_uuid}' failed: {err}");
                FxHashMap::default()
            }
        };
        let mut groups: Vec<GroupDetails> = details.into_values().collect();
        groups.sort_by_key(|group| group.priority);

        for group in &groups {
            let direct = match self.store.fetch_direct_permissions_of_group(&group.id) {
                Ok(direct) => direct,
                Err(err) => {
                    error!("rule lookup for '{}' failed: {err}", group.name);
                    continue;
                }
            };
            for rule in &direct {
                if let Some((base, state)) = rules::parse_rule(rule) {
                    effective.insert(base.to_owned(), state);
                }
            }
        }

        let compiled = rules::compile_rule_set(&effective);
        self.cache.store_player_rules(player_uuid, compiled.clone());
        compiled
    }

    fn has_permission(&self, player_uuid: &str, permission_node: &str) -> bool {
        let compiled = self.effective_player_rules(player_uuid);
        if let Some(state) = rules::first_match(&compiled, permission_node) {
            return state;
        }

        // No rule matched: the node's registered default decides.
        if let Some(default_value) = self.cache.find_permission_default(permission_node) {
            return default_value;
        }
        match self.store.fetch_all_permission_defaults() {
            Ok(defaults) => {
                if let Some(&default_value) = defaults.get(permission_node) {
                    self.cache
                        .store_permission_default(permission_node, default_value);
                    return default_value;
                }
            }
            Err(err) => error!("default lookup for '{permission_node}' failed: {err}"),
        }
        // Unregistered nodes are denied.
        false
    }
}
