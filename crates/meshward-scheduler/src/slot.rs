//! Phase offsets that spread probes across the ping interval.

use std::time::Duration;

use sha2::{Digest, Sha256};

/// A client's fixed position inside the probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub identity: String,
    /// Delay from the start of a tick until this client is probed.
    pub offset: Duration,
}

impl ScheduleSlot {
    /// Derive the slot for `identity` within `interval`.
    ///
    /// Uses SHA-256 rather than the std hasher so the offset is the same
    /// across restarts and builds.
    pub fn derive(identity: &str, interval: Duration) -> Self {
        Self {
            identity: identity.to_string(),
            offset: phase_offset(identity, interval),
        }
    }
}

/// `hash(identity) mod interval`, at millisecond resolution.
pub fn phase_offset(identity: &str, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis() as u64;
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let digest = Sha256::digest(identity.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Duration::from_millis(u64::from_be_bytes(prefix) % interval_ms)
}
