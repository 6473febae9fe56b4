//! Wall-clock helpers. Registry timestamps are Unix epoch seconds.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
