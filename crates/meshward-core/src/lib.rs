//! meshward-core: shared configuration for the meshward server and client.
//!
//! Parses `meshward.toml` into [`ServerConfig`] / [`ClientConfig`],
//! validates them, and exposes a [`ConfigHandle`] that long-running loops
//! re-read at the top of every tick. The handle can be fed by a polling
//! file watcher for hot reload.

pub mod clock;
pub mod config;
pub mod error;
pub mod handle;

pub use clock::epoch_secs;
pub use config::{ClientConfig, ProbeKind, ServerConfig, ensure_valid};
pub use error::{ConfigError, ConfigResult};
pub use handle::{ConfigHandle, Reloadable};
