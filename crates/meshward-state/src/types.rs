//! Persisted record types.

use serde::{Deserialize, Serialize};

/// The durable part of a client record: where it was and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAddress {
    pub identity: String,
    /// IP literal or host name.
    pub address: String,
    /// Unix epoch seconds.
    pub last_seen: u64,
}
