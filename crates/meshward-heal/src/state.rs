//! HealState: the client-side auto-heal state machine.
//!
//! ```text
//!            enable                 threshold crossed, no cooldown
//!   Idle ───────────▶ Monitoring ───────────────────────────────▶ Remediating
//!    ▲                  ▲    │ ok / below threshold                     │
//!    │ disable          │    └──────────────┘                           │ finished
//!    │                  │ cooldown elapsed                              ▼
//!    └──────────────────┴────────────────────────────────────────── Cooldown
//! ```
//!
//! Pure and synchronous: the caller supplies the clock and runs the
//! remediation itself. Disabling while `Remediating` only takes effect
//! when `finish_remediation` is called.
//!
//! After `max_failed_remediations` failed remediations in a row the state
//! stands down: threshold crossings stop firing until a probe succeeds.
//! Manual runs are still accepted.

use std::time::Duration;

use meshward_core::{ClientConfig, epoch_secs};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest cooldown multiplier applied after repeated failed remediations.
const MAX_BACKOFF_EXPONENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealPhase {
    Idle,
    Monitoring,
    Remediating,
    Cooldown,
}

/// What the caller should do after a probe sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not enabled; the sample was recorded but nothing more.
    Disabled,
    Healthy,
    /// Failing but below the threshold.
    Degraded { failures: u32 },
    /// Failing past the threshold, but a cooldown or remediation blocks action.
    Suppressed { failures: u32 },
    /// Run the remediation sequence now. The state is already `Remediating`.
    Remediate { failures: u32 },
    /// Failing past the threshold, but remediation keeps failing and
    /// auto-heal stands down until the target answers again.
    Exhausted { failures: u32 },
}

/// Observable health of the monitored link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub last_ping_ok: Option<bool>,
    pub last_ping_at: Option<u64>,
    pub consecutive_failures: u32,
    pub last_restart_at: Option<u64>,
    pub remediations: u64,
    /// Remediations in a row that had at least one failed step.
    pub failed_remediations: u32,
    /// Auto-heal has stopped firing after too many failed remediations.
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct HealState {
    phase: HealPhase,
    enabled: bool,
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    max_failed: u32,
    /// `consecutive_failures` when the last remediation fired.
    fired_at_failures: u32,
    cooldown_until: Option<Instant>,
    snapshot: HealthSnapshot,
}

impl HealState {
    pub fn new(threshold: u32, cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            phase: HealPhase::Idle,
            enabled: false,
            threshold: threshold.max(1),
            base_cooldown: cooldown,
            max_cooldown: max_cooldown.max(cooldown),
            max_failed: u32::MAX,
            fired_at_failures: 0,
            cooldown_until: None,
            snapshot: HealthSnapshot::default(),
        }
    }

    /// Stand down after `limit` failed remediations in a row.
    pub fn with_max_failed_remediations(mut self, limit: u32) -> Self {
        self.max_failed = limit.max(1);
        self
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.cooldown(),
            config.max_cooldown(),
        )
        .with_max_failed_remediations(config.max_failed_remediations)
    }

    /// Adopt reloaded thresholds. Takes effect from the next sample.
    /// `auto_heal_enabled` is applied by the controller.
    pub fn configure(&mut self, config: &ClientConfig) {
        self.threshold = config.failure_threshold.max(1);
        self.base_cooldown = config.cooldown();
        self.max_cooldown = config.max_cooldown();
        self.max_failed = config.max_failed_remediations.max(1);
    }

    pub fn phase(&self) -> HealPhase {
        self.phase
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.clone()
    }

    /// Time left on the current cooldown, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn enable(&mut self, now: Instant) {
        self.enabled = true;
        if self.phase == HealPhase::Idle {
            // A cooldown from before the disable still binds.
            self.phase = if self.cooldown_remaining(now).is_some() {
                HealPhase::Cooldown
            } else {
                HealPhase::Monitoring
            };
            info!(phase = ?self.phase, "auto-heal enabled");
        }
    }

    /// Safe from any phase. A remediation in flight keeps `Remediating`
    /// until it reports back.
    pub fn disable(&mut self) {
        self.enabled = false;
        if self.phase != HealPhase::Remediating {
            self.phase = HealPhase::Idle;
        }
        info!(phase = ?self.phase, "auto-heal disabled");
    }

    /// Expire a finished cooldown.
    pub fn tick(&mut self, now: Instant) {
        if self.phase == HealPhase::Cooldown && self.cooldown_remaining(now).is_none() {
            debug!("cooldown elapsed, back to monitoring");
            self.phase = HealPhase::Monitoring;
        }
    }

    /// Record one probe of the target and decide what happens next.
    pub fn observe(&mut self, ok: bool, now: Instant) -> Decision {
        self.snapshot.last_ping_ok = Some(ok);
        self.snapshot.last_ping_at = Some(epoch_secs());
        if ok {
            self.snapshot.consecutive_failures = 0;
            self.snapshot.failed_remediations = 0;
            self.fired_at_failures = 0;
            if self.snapshot.exhausted {
                info!("target answering again, auto-heal resumes");
                self.snapshot.exhausted = false;
            }
        } else {
            self.snapshot.consecutive_failures = self.snapshot.consecutive_failures.saturating_add(1);
        }
        self.tick(now);

        let failures = self.snapshot.consecutive_failures;
        match self.phase {
            HealPhase::Idle => Decision::Disabled,
            _ if ok => Decision::Healthy,
            HealPhase::Monitoring if self.snapshot.exhausted && failures >= self.threshold => {
                Decision::Exhausted { failures }
            }
            HealPhase::Monitoring if failures.saturating_sub(self.fired_at_failures) >= self.threshold => {
                self.fired_at_failures = failures;
                self.phase = HealPhase::Remediating;
                Decision::Remediate { failures }
            }
            HealPhase::Monitoring if failures < self.threshold => Decision::Degraded { failures },
            _ => Decision::Suppressed { failures },
        }
    }

    /// Start a remediation outside the threshold rules. Refused only while
    /// one is already running.
    pub fn begin_manual(&mut self) -> bool {
        if self.phase == HealPhase::Remediating {
            return false;
        }
        self.fired_at_failures = self.snapshot.consecutive_failures;
        self.phase = HealPhase::Remediating;
        true
    }

    /// Close the current remediation and start its cooldown, measured
    /// from `now`. Returns the cooldown applied.
    pub fn finish_remediation(&mut self, succeeded: bool, now: Instant) -> Duration {
        let exponent = self.snapshot.failed_remediations.min(MAX_BACKOFF_EXPONENT);
        let cooldown = (self.base_cooldown * 2u32.pow(exponent)).min(self.max_cooldown);

        self.snapshot.remediations += 1;
        self.snapshot.last_restart_at = Some(epoch_secs());
        if succeeded {
            self.snapshot.failed_remediations = 0;
            self.snapshot.exhausted = false;
        } else {
            self.snapshot.failed_remediations = self.snapshot.failed_remediations.saturating_add(1);
        }
        if !self.snapshot.exhausted && self.snapshot.failed_remediations >= self.max_failed {
            warn!(
                failed_remediations = self.snapshot.failed_remediations,
                "remediation keeps failing, auto-heal stands down until the target answers"
            );
            self.snapshot.exhausted = true;
        }

        self.cooldown_until = Some(now + cooldown);
        self.phase = if self.enabled {
            HealPhase::Cooldown
        } else {
            HealPhase::Idle
        };
        info!(?cooldown, succeeded, phase = ?self.phase, "remediation finished");
        cooldown
    }
}
