//! Client record and registry statistics.

use std::time::Duration;

use meshward_state::StoredAddress;
use serde::{Deserialize, Serialize};

/// Everything the server knows about one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub identity: String,
    pub address: String,
    /// Unix epoch seconds of the latest heartbeat or successful probe.
    pub last_seen: u64,
    /// `None` until the scheduler has probed this client once.
    pub last_ping_ok: Option<bool>,
    pub last_ping_at: Option<u64>,
    pub consecutive_failures: u32,
}

impl ClientRecord {
    pub(crate) fn new(identity: &str, address: &str, last_seen: u64) -> Self {
        Self {
            identity: identity.to_string(),
            address: address.to_string(),
            last_seen,
            last_ping_ok: None,
            last_ping_at: None,
            consecutive_failures: 0,
        }
    }

    /// Not stale: seen within `stale_after` of `now`.
    pub fn is_active(&self, now: u64, stale_after: Duration) -> bool {
        now.saturating_sub(self.last_seen) <= stale_after.as_secs()
    }

    pub(crate) fn to_stored(&self) -> StoredAddress {
        StoredAddress {
            identity: self.identity.clone(),
            address: self.address.clone(),
            last_seen: self.last_seen,
        }
    }
}

impl From<StoredAddress> for ClientRecord {
    fn from(stored: StoredAddress) -> Self {
        Self::new(&stored.identity, &stored.address, stored.last_seen)
    }
}

/// Aggregate counts over a registry snapshot.
///
/// `active + stale == total` and `online + offline + never_pinged == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub online: usize,
    pub offline: usize,
    pub never_pinged: usize,
}

impl ClientStats {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a ClientRecord>,
        now: u64,
        stale_after: Duration,
    ) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            if record.is_active(now, stale_after) {
                stats.active += 1;
            } else {
                stats.stale += 1;
            }
            match record.last_ping_ok {
                None => stats.never_pinged += 1,
                Some(true) => stats.online += 1,
                Some(false) => stats.offline += 1,
            }
        }
        stats
    }
}
