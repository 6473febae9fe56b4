//! RemediationSequence: the ordered, best-effort overlay restart.
//!
//! Every step runs under its own timeout. A failed step is recorded and
//! the sequence moves on, and re-registration is always attempted last.

use std::sync::Arc;
use std::time::Duration;

use meshward_core::epoch_secs;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::control::OverlayControl;
use crate::reporter::AddressReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStep {
    StopApp,
    StopService,
    StartService,
    StartApp,
    Reregister,
}

impl RemediationStep {
    pub const SEQUENCE: [RemediationStep; 5] = [
        RemediationStep::StopApp,
        RemediationStep::StopService,
        RemediationStep::StartService,
        RemediationStep::StartApp,
        RemediationStep::Reregister,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed(String),
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: RemediationStep,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

/// Aggregated result of one remediation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationReport {
    pub started_at: u64,
    pub finished_at: u64,
    pub steps: Vec<StepReport>,
}

impl RemediationReport {
    /// Every step succeeded.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.outcome.is_ok())
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| !s.outcome.is_ok())
    }
}

pub struct RemediationSequence {
    control: Arc<dyn OverlayControl>,
    reporter: Arc<dyn AddressReporter>,
    step_timeout: Duration,
    step_pause: Duration,
}

impl RemediationSequence {
    pub fn new(
        control: Arc<dyn OverlayControl>,
        reporter: Arc<dyn AddressReporter>,
        step_timeout: Duration,
        step_pause: Duration,
    ) -> Self {
        Self {
            control,
            reporter,
            step_timeout,
            step_pause,
        }
    }

    pub async fn run(&self) -> RemediationReport {
        let started_at = epoch_secs();
        info!("remediation started: stop app, stop service, start service, start app, re-register");

        let mut steps = Vec::with_capacity(RemediationStep::SEQUENCE.len());
        for (i, step) in RemediationStep::SEQUENCE.into_iter().enumerate() {
            if i > 0 && !self.step_pause.is_zero() {
                tokio::time::sleep(self.step_pause).await;
            }
            let started = Instant::now();
            let outcome = self.run_step(step).await;
            if let StepOutcome::Failed(reason) = &outcome {
                warn!(?step, %reason, "remediation step failed, continuing");
            }
            steps.push(StepReport {
                step,
                outcome,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let report = RemediationReport {
            started_at,
            finished_at: epoch_secs(),
            steps,
        };
        info!(
            succeeded = report.succeeded(),
            failed_steps = report.failed_steps().count(),
            "remediation finished"
        );
        report
    }

    async fn run_step(&self, step: RemediationStep) -> StepOutcome {
        let result = tokio::time::timeout(self.step_timeout, async {
            match step {
                RemediationStep::StopApp => self.control.stop_app().await,
                RemediationStep::StopService => self.control.stop_service().await,
                RemediationStep::StartService => self.control.start_service().await,
                RemediationStep::StartApp => self.control.start_app().await,
                RemediationStep::Reregister => self.reporter.report().await,
            }
        })
        .await;

        match result {
            Ok(Ok(())) => StepOutcome::Ok,
            Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
            Err(_) => StepOutcome::Failed(format!("timed out after {:?}", self.step_timeout)),
        }
    }
}
