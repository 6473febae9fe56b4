//! meshward-state: durable address store for meshward.
//!
//! Backed by [redb](https://docs.rs/redb). Maps a client identity to the
//! last address it reported and when it was last seen. The server reloads
//! this table at startup to repopulate the in-memory registry before the
//! first probe cycle.
//!
//! Values are JSON-serialized into redb's `&[u8]` value column keyed by the
//! client identity. The `AddressStore` is `Clone` + `Send` + `Sync` (backed
//! by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::AddressStore;
pub use types::StoredAddress;
