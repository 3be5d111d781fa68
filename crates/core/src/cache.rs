//! Read-optimized in-memory projection of the permission store.
//!
//! Every table sits behind its own reader/writer lock. The name and id
//! tables are mutated together, always taking the name lock before the
//! id lock, so they stay exact inverses. Both inheritance adjacency maps
//! live under a single lock for the same reason.

use crate::data::{CompiledRule, GroupDetails};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::RwLock;

#[derive(Default)]
struct Adjacency {
    parent_to_children: FxHashMap<String, FxHashSet<String>>,
    child_to_parents: FxHashMap<String, FxHashSet<String>>,
}

#[derive(Default)]
pub struct PermissionCache {
    group_names: RwLock<FxHashMap<String, String>>,
    group_ids: RwLock<FxHashMap<String, String>>,
    player_rules: RwLock<FxHashMap<String, Vec<CompiledRule>>>,
    player_groups: RwLock<FxHashMap<String, Vec<GroupDetails>>>,
    group_rules: RwLock<FxHashMap<String, Vec<CompiledRule>>>,
    permission_defaults: RwLock<FxHashMap<String, bool>>,
    inheritance: RwLock<Adjacency>,
}

fn reachable(map: &FxHashMap<String, FxHashSet<String>>, start: &str) -> FxHashSet<String> {
    let mut seen = FxHashSet::default();
    let mut queue = VecDeque::new();
    seen.insert(start.to_owned());
    queue.push_back(start.to_owned());
    while let Some(current) = queue.pop_front() {
        if let Some(next) = map.get(&current) {
            for neighbor in next {
                if seen.insert(neighbor.clone()) {
                    queue.push_back(neighbor.clone());
                }
            }
        }
    }
    seen
}

impl PermissionCache {
    // --- group name <-> id ---

    pub fn find_group_id(&self, group_name: &str) -> Option<String> {
        self.group_names.read().unwrap().get(group_name).cloned()
    }

    pub fn find_group_name(&self, group_id: &str) -> Option<String> {
        self.group_ids.read().unwrap().get(group_id).cloned()
    }

    pub fn store_group(&self, group_name: &str, group_id: &str) {
        let mut names = self.group_names.write().unwrap();
        let mut ids = self.group_ids.write().unwrap();
        if let Some(old_id) = names.get(group_name) {
            ids.remove(old_id);
        }
        names.insert(group_name.to_owned(), group_id.to_owned());
        ids.insert(group_id.to_owned(), group_name.to_owned());
    }

    pub fn invalidate_group(&self, group_name: &str) {
        let mut names = self.group_names.write().unwrap();
        let mut ids = self.group_ids.write().unwrap();
        if let Some(old_id) = names.remove(group_name) {
            ids.remove(&old_id);
        }
    }

    pub fn populate_groups(&self, name_to_id: FxHashMap<String, String>) {
        let mut names = self.group_names.write().unwrap();
        let mut ids = self.group_ids.write().unwrap();
        names.clear();
        ids.clear();
        for (name, id) in name_to_id {
            ids.insert(id.clone(), name.clone());
            names.insert(name, id);
        }
    }

    pub fn group_names_snapshot(&self) -> Vec<String> {
        self.group_names.read().unwrap().keys().cloned().collect()
    }

    // --- per-player compiled rules ---

    pub fn find_player_rules(&self, player_uuid: &str) -> Option<Vec<CompiledRule>> {
        self.player_rules.read().unwrap().get(player_uuid).cloned()
    }

    pub fn store_player_rules(&self, player_uuid: &str, rules: Vec<CompiledRule>) {
        self.player_rules
            .write()
            .unwrap()
            .insert(player_uuid.to_owned(), rules);
    }

    pub fn invalidate_player_rules(&self, player_uuid: &str) {
        self.player_rules.write().unwrap().remove(player_uuid);
    }

    pub fn invalidate_all_player_rules(&self) {
        self.player_rules.write().unwrap().clear();
    }

    // --- per-player group lists ---

    /// Entries whose expiry has passed are filtered out at read time. A
    /// list fully drained by the filter counts as a miss so the caller
    /// reloads from the store.
    pub fn find_player_groups(&self, player_uuid: &str, now: i64) -> Option<Vec<GroupDetails>> {
        let groups = self.player_groups.read().unwrap();
        let cached = groups.get(player_uuid)?;
        let valid: Vec<GroupDetails> = cached
            .iter()
            .filter(|group| group.expiration_time.is_none_or(|expiry| expiry > now))
            .cloned()
            .collect();
        if valid.is_empty() {
            return None;
        }
        Some(valid)
    }

    pub fn store_player_groups(&self, player_uuid: &str, groups: Vec<GroupDetails>) {
        self.player_groups
            .write()
            .unwrap()
            .insert(player_uuid.to_owned(), groups);
    }

    pub fn invalidate_player_groups(&self, player_uuid: &str) {
        self.player_groups.write().unwrap().remove(player_uuid);
    }

    // --- per-group compiled rules ---

    pub fn find_group_rules(&self, group_name: &str) -> Option<Vec<CompiledRule>> {
        self.group_rules.read().unwrap().get(group_name).cloned()
    }

    pub fn store_group_rules(&self, group_name: &str, rules: Vec<CompiledRule>) {
        self.group_rules
            .write()
            .unwrap()
            .insert(group_name.to_owned(), rules);
    }

    pub fn invalidate_group_rules(&self, group_name: &str) {
        self.group_rules.write().unwrap().remove(group_name);
    }

    pub fn invalidate_all_group_rules(&self) {
        self.group_rules.write().unwrap().clear();
    }

    // --- permission defaults ---

    pub fn find_permission_default(&self, permission_name: &str) -> Option<bool> {
        self.permission_defaults
            .read()
            .unwrap()
            .get(permission_name)
            .copied()
    }

    pub fn store_permission_default(&self, permission_name: &str, default_value: bool) {
        self.permission_defaults
            .write()
            .unwrap()
            .insert(permission_name.to_owned(), default_value);
    }

    pub fn populate_permission_defaults(&self, defaults: FxHashMap<String, bool>) {
        *self.permission_defaults.write().unwrap() = defaults;
    }

    pub fn permission_defaults_snapshot(&self) -> FxHashMap<String, bool> {
        self.permission_defaults.read().unwrap().clone()
    }

    // --- inheritance adjacency ---

    pub fn populate_inheritance(
        &self,
        parent_to_children: FxHashMap<String, FxHashSet<String>>,
        child_to_parents: FxHashMap<String, FxHashSet<String>>,
    ) {
        let mut adjacency = self.inheritance.write().unwrap();
        adjacency.parent_to_children = parent_to_children;
        adjacency.child_to_parents = child_to_parents;
    }

    pub fn add_inheritance(&self, child: &str, parent: &str) {
        let mut adjacency = self.inheritance.write().unwrap();
        adjacency
            .child_to_parents
            .entry(child.to_owned())
            .or_default()
            .insert(parent.to_owned());
        adjacency
            .parent_to_children
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_inheritance(&self, child: &str, parent: &str) {
        let mut adjacency = self.inheritance.write().unwrap();
        if let Some(parents) = adjacency.child_to_parents.get_mut(child) {
            parents.remove(parent);
            if parents.is_empty() {
                adjacency.child_to_parents.remove(child);
            }
        }
        if let Some(children) = adjacency.parent_to_children.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                adjacency.parent_to_children.remove(parent);
            }
        }
    }

    /// Drop every edge touching `group_name`, in both directions. Used
    /// when a group is deleted.
    pub fn remove_group_edges(&self, group_name: &str) {
        let mut adjacency = self.inheritance.write().unwrap();
        adjacency.parent_to_children.remove(group_name);
        adjacency.child_to_parents.remove(group_name);
        for children in adjacency.parent_to_children.values_mut() {
            children.remove(group_name);
        }
        for parents in adjacency.child_to_parents.values_mut() {
            parents.remove(group_name);
        }
        adjacency.parent_to_children.retain(|_, set| !set.is_empty());
        adjacency.child_to_parents.retain(|_, set| !set.is_empty());
    }

    /// Whether `end` is reachable from `start` walking parent→children
    /// edges (descendant direction). `start == end` is trivially true.
    pub fn has_path(&self, start: &str, end: &str) -> bool {
        if start == end {
            return true;
        }
        let adjacency = self.inheritance.read().unwrap();
        reachable(&adjacency.parent_to_children, start).contains(end)
    }

    /// The group plus everything it inherits from, transitively.
    pub fn all_ancestors(&self, group_name: &str) -> FxHashSet<String> {
        let adjacency = self.inheritance.read().unwrap();
        reachable(&adjacency.child_to_parents, group_name)
    }

    /// The group plus everything that inherits from it, transitively.
    pub fn descendants(&self, group_name: &str) -> FxHashSet<String> {
        let adjacency = self.inheritance.read().unwrap();
        reachable(&adjacency.parent_to_children, group_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_id_tables_stay_in_lockstep() {
        let cache = PermissionCache::default();
        cache.store_group("admin", "1");
        assert_eq!(cache.find_group_id("admin").as_deref(), Some("1"));
        assert_eq!(cache.find_group_name("1").as_deref(), Some("admin"));

        // Re-pointing a name drops the stale reverse entry.
        cache.store_group("admin", "7");
        assert_eq!(cache.find_group_name("1"), None);
        assert_eq!(cache.find_group_name("7").as_deref(), Some("admin"));

        cache.invalidate_group("admin");
        assert_eq!(cache.find_group_id("admin"), None);
        assert_eq!(cache.find_group_name("7"), None);
    }

    #[test]
    fn adjacency_maps_are_mutual_inverses() {
        let cache = PermissionCache::default();
        cache.add_inheritance("child", "parent");
        cache.add_inheritance("child", "other");
        cache.add_inheritance("grandchild", "child");

        assert!(cache.has_path("parent", "child"));
        assert!(cache.has_path("parent", "grandchild"));
        assert!(!cache.has_path("grandchild", "parent"));

        let ancestors = cache.all_ancestors("grandchild");
        assert!(ancestors.contains("grandchild"));
        assert!(ancestors.contains("child"));
        assert!(ancestors.contains("parent"));
        assert!(ancestors.contains("other"));

        cache.remove_inheritance("child", "other");
        assert!(!cache.all_ancestors("grandchild").contains("other"));
        assert!(!cache.descendants("other").contains("child"));
    }

    #[test]
    fn self_path_short_circuits() {
        let cache = PermissionCache::default();
        assert!(cache.has_path("lonely", "lonely"));
    }

    #[test]
    fn deleting_a_group_drops_its_edges() {
        let cache = PermissionCache::default();
        cache.add_inheritance("a", "b");
        cache.add_inheritance("b", "c");
        cache.remove_group_edges("b");
        assert!(!cache.has_path("c", "a"));
        assert_eq!(cache.all_ancestors("a").len(), 1);
        assert_eq!(cache.descendants("c").len(), 1);
    }

    #[test]
    fn expired_memberships_are_filtered_at_read() {
        let cache = PermissionCache::default();
        let now = 1_000;
        cache.store_player_groups(
            "u1",
            vec![
                GroupDetails {
                    id: "1".into(),
                    name: "fresh".into(),
                    expiration_time: Some(now + 60),
                    ..Default::default()
                },
                GroupDetails {
                    id: "2".into(),
                    name: "stale".into(),
                    expiration_time: Some(now - 1),
                    ..Default::default()
                },
                GroupDetails {
                    id: "3".into(),
                    name: "forever".into(),
                    expiration_time: None,
                    ..Default::default()
                },
            ],
        );

        let groups = cache.find_player_groups("u1", now).unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "forever"]);

        // A fully expired list reads as a miss.
        cache.store_player_groups(
            "u2",
            vec![GroupDetails {
                id: "2".into(),
                name: "stale".into(),
                expiration_time: Some(now),
                ..Default::default()
            }],
        );
        assert!(cache.find_player_groups("u2", now).is_none());
    }
}
