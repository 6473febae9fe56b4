//! meshward-registry: the server's view of every known client.
//!
//! # Architecture
//!
//! ```text
//! ClientRegistry
//!   ├── RwLock<BTreeMap<identity, ClientRecord>>   (single writer at a time)
//!   ├── remember()           ← client heartbeats, written through to the store
//!   ├── record_ping_result() ← scheduler probes, flushed lazily
//!   ├── snapshot() / stats() → owned copies, never references into the map
//!   └── AddressStore         (redb, reloaded at startup)
//! ```
//!
//! Probe results for identities the registry has never seen are dropped,
//! so a late or forged probe result cannot create a phantom client.
//! Persistence failures put the registry into a degraded mode: reads and
//! writes keep working in memory and the failed writes are retried by the
//! next `flush()`.

pub mod record;
pub mod registry;

pub use record::{ClientRecord, ClientStats};
pub use registry::ClientRegistry;
