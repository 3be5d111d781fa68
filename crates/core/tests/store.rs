use authority_core::store::PermissionStore;
use authority_db::{DatabaseDriver, DatabaseKind, DbError, Row, SqliteDriver, SqlValue};
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn test_store() -> PermissionStore {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    let store = PermissionStore::new(driver);
    store.ensure_tables().unwrap();
    store
}

fn name_set(names: &[&str]) -> FxHashSet<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

#[test]
fn schema_bootstrap_is_repeatable() {
    let store = test_store();
    store.ensure_tables().unwrap();
    store.ensure_tables().unwrap();
}

#[test]
fn permission_upsert_updates_in_place() {
    let store = test_store();
    store.upsert_permission("fly", "first", false).unwrap();
    store.upsert_permission("fly", "second", true).unwrap();

    assert_eq!(store.fetch_all_permission_names().unwrap(), vec!["fly".to_string()]);
    let defaults = store.fetch_all_permission_defaults().unwrap();
    assert_eq!(defaults.get("fly"), Some(&true));
    assert!(store.permission_exists("fly").unwrap());
    assert!(!store.permission_exists("walk").unwrap());
}

#[test]
fn group_crud_and_batch_reads() {
    let store = test_store();
    let a = store.create_group("a", "alpha").unwrap().unwrap();
    let b = store.create_group("b", "beta").unwrap().unwrap();
    // Creating again is an upsert returning the same id.
    assert_eq!(store.create_group("a", "ignored").unwrap().unwrap(), a);

    let ids = store.fetch_group_ids_by_names(&name_set(&["a", "b", "ghost"])).unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids.get("a"), Some(&a));

    store.update_group_priority("b", 42).unwrap();
    let details = store
        .fetch_group_details_by_names(&name_set(&["a", "b"]))
        .unwrap();
    assert_eq!(details.get("b").unwrap().priority, 42);
    assert_eq!(details.get("a").unwrap().description, "alpha");

    let names = store.fetch_group_names_by_ids(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(names.get(&b), Some(&"b".to_string()));

    assert!(store.delete_group(&a).unwrap());
    assert!(!store.delete_group(&a).unwrap());
    assert!(!store.group_exists("a").unwrap());
}

#[test]
fn deleting_a_group_cascades_to_related_rows() {
    let store = test_store();
    let parent = store.create_group("parent", "").unwrap().unwrap();
    let child = store.create_group("child", "").unwrap().unwrap();
    store.add_permission_to_group(&parent, "build").unwrap();
    store.add_group_inheritance(&child, &parent).unwrap();
    store.add_player_to_group("u1", &parent, None).unwrap();

    assert!(store.delete_group(&parent).unwrap());
    assert!(store.fetch_direct_permissions_of_group(&parent).unwrap().is_empty());
    assert!(store.fetch_direct_parent_group_ids(&child).unwrap().is_empty());
    assert!(store.fetch_players_in_group(&parent).unwrap().is_empty());
}

#[test]
fn membership_upsert_switches_expiry_atomically() {
    let store = test_store();
    let g = store.create_group("g", "").unwrap().unwrap();

    store.add_player_to_group("u1", &g, None).unwrap();
    let groups = store.fetch_player_groups_with_details("u1", 1_000).unwrap();
    assert_eq!(groups[0].expiration_time, None);

    // Permanent -> timed is one observable state change, not a duplicate
    // row.
    store.add_player_to_group("u1", &g, Some(2_000)).unwrap();
    let groups = store.fetch_player_groups_with_details("u1", 1_000).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].expiration_time, Some(2_000));

    // And back again via the re-timing update.
    assert!(store
        .update_player_group_expiration_time("u1", &g, None)
        .unwrap());
    let groups = store.fetch_player_groups_with_details("u1", 1_000).unwrap();
    assert_eq!(groups[0].expiration_time, None);

    assert!(!store
        .update_player_group_expiration_time("u2", &g, None)
        .unwrap());
}

#[test]
fn expired_rows_are_reaped_with_affected_players() {
    let store = test_store();
    let g = store.create_group("g", "").unwrap().unwrap();
    let h = store.create_group("h", "").unwrap().unwrap();
    store.add_player_to_group("gone", &g, Some(500)).unwrap();
    store.add_player_to_group("gone", &h, Some(400)).unwrap();
    store.add_player_to_group("stays", &g, Some(5_000)).unwrap();
    store.add_player_to_group("forever", &g, None).unwrap();

    let affected = store.delete_expired_player_groups(1_000).unwrap();
    // Distinct player set, not one entry per reaped row.
    assert_eq!(affected, vec!["gone".to_string()]);

    let remaining = store.fetch_players_in_groups(&[g, h]).unwrap();
    let remaining: FxHashSet<String> = remaining.into_iter().collect();
    assert_eq!(remaining, name_set(&["stays", "forever"]));

    // Nothing left to reap.
    assert!(store.delete_expired_player_groups(1_000).unwrap().is_empty());
}

#[test]
fn inheritance_map_covers_all_edges() {
    let store = test_store();
    let a = store.create_group("a", "").unwrap().unwrap();
    let b = store.create_group("b", "").unwrap().unwrap();
    let c = store.create_group("c", "").unwrap().unwrap();
    store.add_group_inheritance(&a, &b).unwrap();
    store.add_group_inheritance(&c, &b).unwrap();

    let parent_to_children = store.fetch_all_inheritance().unwrap();
    assert_eq!(parent_to_children.len(), 1);
    assert_eq!(parent_to_children.get("b").unwrap(), &name_set(&["a", "c"]));

    assert!(store.remove_group_inheritance(&a, &b).unwrap());
    assert!(!store.remove_group_inheritance(&a, &b).unwrap());
}

/// Delegates to SQLite but fails the nth write, to prove batch methods
/// roll back to a clean slate.
struct FailingDriver {
    inner: SqliteDriver,
    writes_left: AtomicUsize,
}

impl FailingDriver {
    fn failing_after(writes: usize) -> Self {
        FailingDriver {
            inner: SqliteDriver::open_in_memory().unwrap(),
            writes_left: AtomicUsize::new(writes),
        }
    }
}

impl DatabaseDriver for FailingDriver {
    fn kind(&self) -> DatabaseKind {
        self.inner.kind()
    }

    fn execute(&self, sql: &str) -> Result<(), DbError> {
        self.inner.execute(sql)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.inner.query(sql)
    }

    fn execute_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        if sql.trim_start().starts_with("INSERT") {
            let exhausted = self
                .writes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err();
            if exhausted {
                return Err(rusqlite::Error::InvalidQuery.into());
            }
        }
        self.inner.execute_prepared(sql, params)
    }

    fn query_prepared(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.inner.query_prepared(sql, params)
    }

    fn begin(&self) -> Result<(), DbError> {
        self.inner.begin()
    }

    fn commit(&self) -> Result<(), DbError> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.inner.rollback()
    }

    fn insert_or_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        conflict_columns: &str,
    ) -> String {
        self.inner
            .insert_or_ignore_sql(table, columns, values, conflict_columns)
    }

    fn autoincrement_pk(&self) -> &'static str {
        self.inner.autoincrement_pk()
    }
}

#[test]
fn failed_batch_rolls_back_to_zero() {
    // Budget of two inserts: group creation and the first rule. The
    // second rule of the batch fails, and the first must not survive
    // the rollback.
    let store = PermissionStore::new(Arc::new(FailingDriver::failing_after(2)));
    store.ensure_tables().unwrap();
    let g = store.create_group("g", "").unwrap().unwrap();

    let rules = vec!["rule.one".to_string(), "rule.two".to_string()];
    assert!(store.add_permissions_to_group(&g, &rules).is_err());
    assert!(store.fetch_direct_permissions_of_group(&g).unwrap().is_empty());
}
