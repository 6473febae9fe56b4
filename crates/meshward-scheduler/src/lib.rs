//! meshward-scheduler: reachability probing for the client registry.
//!
//! # Architecture
//!
//! ```text
//! PingScheduler::run()
//!   ├── every ping_interval: ConfigHandle::current() + registry snapshot
//!   ├── per client: sleep(phase_offset) → semaphore permit → Prober::probe()
//!   └── ClientRegistry::record_ping_result()  (unknown identities dropped)
//!
//! Prober
//!   ├── PingProber  (system ping, one echo)
//!   └── TcpProber   (TCP connect)
//! ```
//!
//! Phase offsets come from a stable hash of the identity, so a client is
//! probed at the same point of every cycle and a growing client set does
//! not produce synchronized bursts.

pub mod probe;
pub mod scheduler;
pub mod slot;

pub use probe::{PingProber, ProbeOutcome, Prober, TcpProber, probe_deadline, prober_for};
pub use scheduler::PingScheduler;
pub use slot::{ScheduleSlot, phase_offset};
