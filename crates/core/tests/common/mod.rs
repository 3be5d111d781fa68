use authority_core::manager::PermissionManager;
use authority_db::SqliteDriver;
use std::sync::Arc;
use std::time::Duration;

/// Fresh manager over a private in-memory database. A zero-width
/// invalidator pool makes invalidation synchronous and the long sweeper
/// interval keeps the timer out of the way, so assertions never race.
pub fn test_manager() -> PermissionManager {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    let manager = PermissionManager::new();
    assert!(manager.init(driver, false, 0, Duration::from_secs(3600)));
    manager
}
