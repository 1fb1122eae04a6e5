use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, the timestamp base for all
/// last-write-wins fields.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
