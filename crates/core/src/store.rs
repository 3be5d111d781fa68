//! Typed persistence API over the storage driver.
//!
//! Every value that could be user-supplied is bound through a prepared
//! statement. Multi-row writes run inside a transaction and report a
//! success count of zero when rolled back. Batch reads are first-class
//! so cache warmup and invalidation fan-out avoid N+1 query storms.

use crate::data::GroupDetails;
use authority_db::{DatabaseDriver, DbError, Row, SqlValue};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

pub struct PermissionStore {
    db: Arc<dyn DatabaseDriver>,
    // Serializes batch methods: the driver shares one connection, so two
    // overlapping BEGINs would nest.
    tx_gate: Mutex<()>,
}

fn parse_priority(cell: Option<&str>, group: &str) -> i32 {
    match cell {
        None | Some("") => 0,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("store: group '{group}' has non-integer priority '{raw}', using 0");
            0
        }),
    }
}

fn parse_expiry(cell: Option<&str>) -> Option<i64> {
    match cell {
        None | Some("") => None,
        Some(raw) => match raw.parse() {
            Ok(ts) => Some(ts),
            Err(_) => {
                warn!("store: ignoring non-integer expiry timestamp '{raw}'");
                None
            }
        },
    }
}

fn details_from_row(row: &Row) -> Option<GroupDetails> {
    let id = row.first()?.clone()?;
    let name = row.get(1)?.clone()?;
    let description = row.get(2).cloned().flatten().unwrap_or_default();
    let priority = parse_priority(row.get(3).and_then(|c| c.as_deref()), &name);
    let expiration_time = parse_expiry(row.get(4).and_then(|c| c.as_deref()));
    Some(GroupDetails {
        id,
        name,
        description,
        priority,
        expiration_time,
    })
}

impl PermissionStore {
    pub fn new(db: Arc<dyn DatabaseDriver>) -> Self {
        PermissionStore {
            db,
            tx_gate: Mutex::new(()),
        }
    }

    /// Idempotent schema bootstrap. Safe to run on every startup; the
    /// driver translates "already exists" style failures into success.
    pub fn ensure_tables(&self) -> Result<(), DbError> {
        debug!("store: ensuring schema");
        self.db.execute(&self.db.create_table_sql(
            "permissions",
            &format!(
                "id {}, \
                 name VARCHAR(255) UNIQUE NOT NULL, \
                 description TEXT, \
                 default_value INT NOT NULL DEFAULT 0",
                self.db.autoincrement_pk()
            ),
        ))?;
        self.db.execute(&self.db.create_table_sql(
            "permission_groups",
            &format!(
                "id {}, \
                 name VARCHAR(255) UNIQUE NOT NULL, \
                 description TEXT, \
                 priority INT NOT NULL DEFAULT 0",
                self.db.autoincrement_pk()
            ),
        ))?;
        self.db.execute(&self.db.create_table_sql(
            "group_permissions",
            "group_id INT NOT NULL, \
             permission_rule VARCHAR(255) NOT NULL, \
             PRIMARY KEY (group_id, permission_rule), \
             FOREIGN KEY (group_id) REFERENCES permission_groups(id) ON DELETE CASCADE",
        ))?;
        self.db.execute(&self.db.create_table_sql(
            "group_inheritance",
            "group_id INT NOT NULL, \
             parent_group_id INT NOT NULL, \
             PRIMARY KEY (group_id, parent_group_id), \
             FOREIGN KEY (group_id) REFERENCES permission_groups(id) ON DELETE CASCADE, \
             FOREIGN KEY (parent_group_id) REFERENCES permission_groups(id) ON DELETE CASCADE",
        ))?;
        self.db.execute(&self.db.create_table_sql(
            "player_groups",
            "player_uuid VARCHAR(36) NOT NULL, \
             group_id INT NOT NULL, \
             expiry_timestamp BIGINT NULL DEFAULT NULL, \
             PRIMARY KEY (player_uuid, group_id), \
             FOREIGN KEY (group_id) REFERENCES permission_groups(id) ON DELETE CASCADE",
        ))?;
        // Upgrade path for schemas that predate timed memberships.
        self.db.execute(&self.db.add_column_sql(
            "player_groups",
            "expiry_timestamp",
            "BIGINT NULL DEFAULT NULL",
        ))?;
        self.db
            .execute(&self.db.create_index_sql("idx_permissions_name", "permissions", "name"))?;
        self.db.execute(&self.db.create_index_sql(
            "idx_permission_groups_name",
            "permission_groups",
            "name",
        ))?;
        self.db.execute(&self.db.create_index_sql(
            "idx_player_groups_uuid",
            "player_groups",
            "player_uuid",
        ))?;
        Ok(())
    }

    fn in_transaction<T>(
        &self,
        run: impl FnOnce() -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let _gate = self.tx_gate.lock().unwrap();
        self.db.begin()?;
        match run() {
            Ok(value) => match self.db.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    if let Err(rollback_err) = self.db.rollback() {
                        error!("store: rollback after failed commit failed: {rollback_err}");
                    }
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = self.db.rollback() {
                    error!("store: rollback failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    // --- permissions ---

    pub fn upsert_permission(
        &self,
        name: &str,
        description: &str,
        default_value: bool,
    ) -> Result<(), DbError> {
        let default_value: i64 = if default_value { 1 } else { 0 };
        let insert = self.db.insert_or_ignore_sql(
            "permissions",
            "name, description, default_value",
            "?, ?, ?",
            "name",
        );
        self.db
            .execute_prepared(&insert, &[name.into(), description.into(), default_value.into()])?;
        self.db.execute_prepared(
            "UPDATE permissions SET description = ?, default_value = ? WHERE name = ?;",
            &[description.into(), default_value.into(), name.into()],
        )?;
        Ok(())
    }

    pub fn permission_exists(&self, name: &str) -> Result<bool, DbError> {
        let rows = self
            .db
            .query_prepared("SELECT 1 FROM permissions WHERE name = ? LIMIT 1;", &[name.into()])?;
        Ok(!rows.is_empty())
    }

    pub fn fetch_all_permission_names(&self) -> Result<Vec<String>, DbError> {
        let rows = self.db.query("SELECT name FROM permissions;")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub fn fetch_all_permission_defaults(&self) -> Result<FxHashMap<String, bool>, DbError> {
        let rows = self.db.query("SELECT name, default_value FROM permissions;")?;
        let mut defaults = FxHashMap::default();
        for row in rows {
            let Some(name) = row.first().cloned().flatten() else {
                continue;
            };
            let value = match row.get(1).and_then(|c| c.as_deref()) {
                Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                    warn!("store: permission '{name}' has non-integer default '{raw}', using 0");
                    0
                }),
                None => 0,
            };
            defaults.insert(name, value != 0);
        }
        Ok(defaults)
    }

    // --- groups ---

    /// Creates the group if it does not exist and returns its id, or
    /// `None` when the row could not be produced.
    pub fn create_group(&self, name: &str, description: &str) -> Result<Option<String>, DbError> {
        let insert = self.db.insert_or_ignore_sql(
            "permission_groups",
            "name, description",
            "?, ?",
            "name",
        );
        self.db
            .execute_prepared(&insert, &[name.into(), description.into()])?;
        self.fetch_group_id_by_name(name)
    }

    /// Cascades through rules, inheritance edges and memberships.
    pub fn delete_group(&self, group_id: &str) -> Result<bool, DbError> {
        let affected = self.db.execute_prepared(
            "DELETE FROM permission_groups WHERE id = ?;",
            &[group_id.into()],
        )?;
        Ok(affected > 0)
    }

    pub fn fetch_group_id_by_name(&self, name: &str) -> Result<Option<String>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT id FROM permission_groups WHERE name = ? LIMIT 1;",
            &[name.into()],
        )?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next().flatten()))
    }

    pub fn fetch_all_group_names(&self) -> Result<Vec<String>, DbError> {
        let rows = self.db.query("SELECT name FROM permission_groups;")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub fn group_exists(&self, name: &str) -> Result<bool, DbError> {
        let rows = self.db.query_prepared(
            "SELECT 1 FROM permission_groups WHERE name = ? LIMIT 1;",
            &[name.into()],
        )?;
        Ok(!rows.is_empty())
    }

    pub fn fetch_group_details(&self, name: &str) -> Result<Option<GroupDetails>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT id, name, description, priority FROM permission_groups WHERE name = ? LIMIT 1;",
            &[name.into()],
        )?;
        Ok(rows.first().and_then(details_from_row))
    }

    pub fn fetch_group_priority(&self, name: &str) -> Result<i32, DbError> {
        let rows = self.db.query_prepared(
            "SELECT priority FROM permission_groups WHERE name = ? LIMIT 1;",
            &[name.into()],
        )?;
        let cell = rows.first().and_then(|row| row.first()).cloned().flatten();
        Ok(parse_priority(cell.as_deref(), name))
    }

    pub fn update_group_priority(&self, name: &str, priority: i32) -> Result<(), DbError> {
        self.db.execute_prepared(
            "UPDATE permission_groups SET priority = ? WHERE name = ?;",
            &[i64::from(priority).into(), name.into()],
        )?;
        Ok(())
    }

    pub fn update_group_description(&self, name: &str, description: &str) -> Result<(), DbError> {
        self.db.execute_prepared(
            "UPDATE permission_groups SET description = ? WHERE name = ?;",
            &[description.into(), name.into()],
        )?;
        Ok(())
    }

    pub fn fetch_group_description(&self, name: &str) -> Result<Option<String>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT description FROM permission_groups WHERE name = ? LIMIT 1;",
            &[name.into()],
        )?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next().flatten()))
    }

    // --- group rules ---

    pub fn add_permission_to_group(&self, group_id: &str, rule: &str) -> Result<(), DbError> {
        let insert = self.db.insert_or_ignore_sql(
            "group_permissions",
            "group_id, permission_rule",
            "?, ?",
            "group_id, permission_rule",
        );
        self.db
            .execute_prepared(&insert, &[group_id.into(), rule.into()])?;
        Ok(())
    }

    pub fn remove_permission_from_group(&self, group_id: &str, rule: &str) -> Result<bool, DbError> {
        let affected = self.db.execute_prepared(
            "DELETE FROM group_permissions WHERE group_id = ? AND permission_rule = ?;",
            &[group_id.into(), rule.into()],
        )?;
        Ok(affected > 0)
    }

    pub fn fetch_direct_permissions_of_group(&self, group_id: &str) -> Result<Vec<String>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT permission_rule FROM group_permissions WHERE group_id = ?;",
            &[group_id.into()],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub fn add_permissions_to_group(
        &self,
        group_id: &str,
        rules: &[String],
    ) -> Result<usize, DbError> {
        if rules.is_empty() {
            return Ok(0);
        }
        let insert = self.db.insert_or_ignore_sql(
            "group_permissions",
            "group_id, permission_rule",
            "?, ?",
            "group_id, permission_rule",
        );
        self.in_transaction(|| {
            let mut count = 0;
            for rule in rules {
                if rule.is_empty() || rule == "-" {
                    continue;
                }
                if self
                    .db
                    .execute_prepared(&insert, &[group_id.into(), rule.as_str().into()])?
                    > 0
                {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    pub fn remove_permissions_from_group(
        &self,
        group_id: &str,
        rules: &[String],
    ) -> Result<usize, DbError> {
        if rules.is_empty() {
            return Ok(0);
        }
        self.in_transaction(|| {
            let mut count = 0;
            for rule in rules {
                if rule.is_empty() || rule == "-" {
                    continue;
                }
                if self.db.execute_prepared(
                    "DELETE FROM group_permissions WHERE group_id = ? AND permission_rule = ?;",
                    &[group_id.into(), rule.as_str().into()],
                )? > 0
                {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    // --- inheritance ---

    pub fn add_group_inheritance(&self, group_id: &str, parent_id: &str) -> Result<(), DbError> {
        let insert = self.db.insert_or_ignore_sql(
            "group_inheritance",
            "group_id, parent_group_id",
            "?, ?",
            "group_id, parent_group_id",
        );
        self.db
            .execute_prepared(&insert, &[group_id.into(), parent_id.into()])?;
        Ok(())
    }

    pub fn remove_group_inheritance(&self, group_id: &str, parent_id: &str) -> Result<bool, DbError> {
        let affected = self.db.execute_prepared(
            "DELETE FROM group_inheritance WHERE group_id = ? AND parent_group_id = ?;",
            &[group_id.into(), parent_id.into()],
        )?;
        Ok(affected > 0)
    }

    /// `parent name -> {child names}` over the whole edge set, for cache
    /// population.
    pub fn fetch_all_inheritance(&self) -> Result<FxHashMap<String, FxHashSet<String>>, DbError> {
        let rows = self.db.query(
            "SELECT child.name, parent.name \
             FROM group_inheritance gi \
             JOIN permission_groups child ON gi.group_id = child.id \
             JOIN permission_groups parent ON gi.parent_group_id = parent.id;",
        )?;
        let mut parent_to_children: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for row in rows {
            let (Some(Some(child)), Some(Some(parent))) = (row.first().cloned(), row.get(1).cloned())
            else {
                continue;
            };
            parent_to_children.entry(parent).or_default().insert(child);
        }
        Ok(parent_to_children)
    }

    pub fn fetch_direct_parent_group_ids(&self, group_id: &str) -> Result<Vec<String>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT parent_group_id FROM group_inheritance WHERE group_id = ?;",
            &[group_id.into()],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    // --- memberships ---

    /// Upsert: the previous row (and with it any previous expiry) is
    /// dropped and re-inserted in one transaction, so switching between
    /// permanent and time-limited is a single observable state change.
    pub fn add_player_to_group(
        &self,
        player_uuid: &str,
        group_id: &str,
        expiry_timestamp: Option<i64>,
    ) -> Result<(), DbError> {
        self.in_transaction(|| {
            self.db.execute_prepared(
                "DELETE FROM player_groups WHERE player_uuid = ? AND group_id = ?;",
                &[player_uuid.into(), group_id.into()],
            )?;
            self.db.execute_prepared(
                "INSERT INTO player_groups (player_uuid, group_id, expiry_timestamp) VALUES (?, ?, ?);",
                &[player_uuid.into(), group_id.into(), expiry_timestamp.into()],
            )?;
            Ok(())
        })
    }

    pub fn remove_player_from_group(&self, player_uuid: &str, group_id: &str) -> Result<bool, DbError> {
        let affected = self.db.execute_prepared(
            "DELETE FROM player_groups WHERE player_uuid = ? AND group_id = ?;",
            &[player_uuid.into(), group_id.into()],
        )?;
        Ok(affected > 0)
    }

    /// Non-expired memberships with full group details.
    pub fn fetch_player_groups_with_details(
        &self,
        player_uuid: &str,
        now: i64,
    ) -> Result<Vec<GroupDetails>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT pg.id, pg.name, pg.description, pg.priority, pgr.expiry_timestamp \
             FROM permission_groups pg \
             JOIN player_groups pgr ON pg.id = pgr.group_id \
             WHERE pgr.player_uuid = ? \
               AND (pgr.expiry_timestamp IS NULL OR pgr.expiry_timestamp > ?);",
            &[player_uuid.into(), now.into()],
        )?;
        Ok(rows.iter().filter_map(details_from_row).collect())
    }

    pub fn fetch_players_in_group(&self, group_id: &str) -> Result<Vec<String>, DbError> {
        let rows = self.db.query_prepared(
            "SELECT player_uuid FROM player_groups WHERE group_id = ?;",
            &[group_id.into()],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub fn fetch_players_in_groups(&self, group_ids: &[String]) -> Result<Vec<String>, DbError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = self.db.in_clause_placeholders(group_ids.len());
        let sql = format!(
            "SELECT DISTINCT player_uuid FROM player_groups WHERE group_id IN ({placeholders});"
        );
        let params: Vec<SqlValue> = group_ids.iter().map(|id| id.as_str().into()).collect();
        let rows = self.db.query_prepared(&sql, &params)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    pub fn fetch_group_ids_by_names(
        &self,
        names: &FxHashSet<String>,
    ) -> Result<FxHashMap<String, String>, DbError> {
        if names.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = self.db.in_clause_placeholders(names.len());
        let sql = format!("SELECT name, id FROM permission_groups WHERE name IN ({placeholders});");
        let params: Vec<SqlValue> = names.iter().map(|name| name.as_str().into()).collect();
        let rows = self.db.query_prepared(&sql, &params)?;
        let mut map = FxHashMap::default();
        for row in rows {
            if let (Some(Some(name)), Some(Some(id))) = (row.first().cloned(), row.get(1).cloned()) {
                map.insert(name, id);
            }
        }
        Ok(map)
    }

    pub fn fetch_group_details_by_names(
        &self,
        names: &FxHashSet<String>,
    ) -> Result<FxHashMap<String, GroupDetails>, DbError> {
        if names.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = self.db.in_clause_placeholders(names.len());
        let sql = format!(
            "SELECT id, name, description, priority FROM permission_groups \
             WHERE name IN ({placeholders});"
        );
        let params: Vec<SqlValue> = names.iter().map(|name| name.as_str().into()).collect();
        let rows = self.db.query_prepared(&sql, &params)?;
        Ok(rows
            .iter()
            .filter_map(details_from_row)
            .map(|details| (details.name.clone(), details))
            .collect())
    }

    pub fn fetch_group_names_by_ids(
        &self,
        group_ids: &[String],
    ) -> Result<FxHashMap<String, String>, DbError> {
        if group_ids.is_empty() {
            return Ok(FxHashMap::default());
        }
        let placeholders = self.db.in_clause_placeholders(group_ids.len());
        let sql = format!("SELECT id, name FROM permission_groups WHERE id IN ({placeholders});");
        let params: Vec<SqlValue> = group_ids.iter().map(|id| id.as_str().into()).collect();
        let rows = self.db.query_prepared(&sql, &params)?;
        let mut map = FxHashMap::default();
        for row in rows {
            if let (Some(Some(id)), Some(Some(name))) = (row.first().cloned(), row.get(1).cloned()) {
                map.insert(id, name);
            }
        }
        Ok(map)
    }

    /// Batch membership grant (permanent). `group_infos` pairs group
    /// names with their ids; the names are only for logging.
    pub fn add_player_to_groups(
        &self,
        player_uuid: &str,
        group_infos: &[(String, String)],
    ) -> Result<usize, DbError> {
        if group_infos.is_empty() {
            return Ok(0);
        }
        let insert = self.db.insert_or_ignore_sql(
            "player_groups",
            "player_uuid, group_id",
            "?, ?",
            "player_uuid, group_id",
        );
        self.in_transaction(|| {
            let mut count = 0;
            for (_, group_id) in group_infos {
                if self
                    .db
                    .execute_prepared(&insert, &[player_uuid.into(), group_id.as_str().into()])?
                    > 0
                {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    pub fn remove_player_from_groups(
        &self,
        player_uuid: &str,
        group_ids: &[String],
    ) -> Result<usize, DbError> {
        if group_ids.is_empty() {
            return Ok(0);
        }
        self.in_transaction(|| {
            let mut count = 0;
            for group_id in group_ids {
                if self.db.execute_prepared(
                    "DELETE FROM player_groups WHERE player_uuid = ? AND group_id = ?;",
                    &[player_uuid.into(), group_id.as_str().into()],
                )? > 0
                {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Reaps every timed-out membership and returns the distinct set of
    /// players that lost one, for targeted invalidation.
    pub fn delete_expired_player_groups(&self, now: i64) -> Result<Vec<String>, DbError> {
        self.in_transaction(|| {
            let rows = self.db.query_prepared(
                "SELECT DISTINCT player_uuid FROM player_groups \
                 WHERE expiry_timestamp IS NOT NULL AND expiry_timestamp <= ?;",
                &[now.into()],
            )?;
            let affected: Vec<String> = rows
                .into_iter()
                .filter_map(|row| row.into_iter().next().flatten())
                .collect();
            if !affected.is_empty() {
                self.db.execute_prepared(
                    "DELETE FROM player_groups \
                     WHERE expiry_timestamp IS NOT NULL AND expiry_timestamp <= ?;",
                    &[now.into()],
                )?;
                debug!("store: reaped expired memberships of {} players", affected.len());
            }
            Ok(affected)
        })
    }

    /// `None` expiry makes the membership permanent. The update succeeds
    /// only when the membership row exists.
    pub fn update_player_group_expiration_time(
        &self,
        player_uuid: &str,
        group_id: &str,
        expiry_timestamp: Option<i64>,
    ) -> Result<bool, DbError> {
        let affected = self.db.execute_prepared(
            "UPDATE player_groups SET expiry_timestamp = ? WHERE player_uuid = ? AND group_id = ?;",
            &[expiry_timestamp.into(), player_uuid.into(), group_id.into()],
        )?;
        Ok(affected > 0)
    }
}
