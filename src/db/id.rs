//! Primary-key generation.

use chrono::Utc;
use uuid::Uuid;

/// Generate a unique, time-ordered id string.
///
/// 50 characters: the current Unix time in milliseconds zero-padded to 15 digits,
/// 32 hex digits of a random v4 uuid, then `000`. Ids sort by creation time to the
/// millisecond.
pub fn next_id() -> String {
    format!(
        "{:015}{}000",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}
