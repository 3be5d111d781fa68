use regex::Regex;

/// A task for the asynchronous cache invalidator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTask {
    /// A group's rules, priority or inheritance changed. Affects the
    /// group itself, every descendant group, and every member of those
    /// groups.
    GroupModified(String),
    /// A player's memberships changed; their compiled rules and group
    /// list are stale.
    PlayerGroupChanged(String),
    /// Every compiled rule set, group and player alike, is stale.
    AllGroupsModified,
    /// Every per-player compiled rule set is stale.
    AllPlayersModified,
    /// Drain marker; one is queued per worker on stop.
    Shutdown,
}

/// A group row as the store returns it. `expiration_time` is only set on
/// rows fetched through a membership join; it is `None` both for plain
/// group lookups and for permanent memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDetails {
    pub id: String,
    pub name: String,
    pub description: String,
    pub priority: i32,
    pub expiration_time: Option<i64>,
}

/// A wildcard rule compiled to an anchored, case-insensitive matcher.
/// `state` is `true` for a grant and `false` for a denial.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub pattern: String,
    pub matcher: Regex,
    pub state: bool,
}
