use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch. Membership expiry timestamps are stored
/// in this unit.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
