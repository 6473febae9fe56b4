//! meshward-heal: client-side detect-and-restart for the overlay link.
//!
//! # Architecture
//!
//! ```text
//! HealController::run()
//!   ├── every ping_interval: Prober::probe(target_address)
//!   ├── HealState::observe() → Decision
//!   └── Decision::Remediate → RemediationSequence::run()
//!         ├── OverlayControl: stop app → stop service → start service → start app
//!         └── AddressReporter: re-register with the server
//! ```
//!
//! # Self-Healing
//!
//! Remediation fires when `failure_threshold` consecutive probes fail and
//! no cooldown is running. The cooldown is measured from the end of the
//! remediation and doubles (up to 16x, capped by `max_cooldown_secs`)
//! after each remediation with a failed step. A successful probe resets
//! the counter and the backoff. After `max_failed_remediations` failed
//! remediations in a row auto-heal stands down until a probe succeeds.
//!
//! Manual runs (`HealController::run_now`) skip the threshold and the
//! cooldown but never overlap an automatic remediation. The CLI routes
//! manual runs from other processes to the live controller.

pub mod control;
pub mod controller;
pub mod error;
pub mod remediation;
pub mod reporter;
pub mod state;

pub use control::{OverlayControl, SystemOverlayControl};
pub use controller::HealController;
pub use error::{HealError, HealResult};
pub use remediation::{
    RemediationReport, RemediationSequence, RemediationStep, StepOutcome, StepReport,
};
pub use reporter::{
    AddressReporter, RememberAck, ServerClient, ServerReporter, discover_overlay_address,
};
pub use state::{Decision, HealPhase, HealState, HealthSnapshot};
