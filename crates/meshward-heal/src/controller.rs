//! HealController: drives HealState from periodic probes of the target.
//!
//! One controller per client process. The automatic loop and manual
//! `run_now()` calls both pass through the same gate, so two remediation
//! sequences never run at once. Other processes reach `run_now()` and
//! `set_enabled()` through the CLI's local control endpoint.
//!
//! `auto_heal_enabled` in a reloaded configuration is applied when it
//! changes, the same way as `set_enabled()`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshward_core::{ClientConfig, ConfigHandle};
use meshward_scheduler::{ProbeOutcome, Prober, probe_deadline};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::OverlayControl;
use crate::error::{HealError, HealResult};
use crate::remediation::{RemediationReport, RemediationSequence};
use crate::reporter::AddressReporter;
use crate::state::{Decision, HealPhase, HealState, HealthSnapshot};

pub struct HealController {
    config: ConfigHandle<ClientConfig>,
    prober: Arc<dyn Prober>,
    control: Arc<dyn OverlayControl>,
    reporter: Arc<dyn AddressReporter>,
    state: Mutex<HealState>,
    /// Held for the whole of a remediation sequence.
    gate: tokio::sync::Mutex<()>,
    enabled: watch::Sender<bool>,
    last_report: Mutex<Option<RemediationReport>>,
}

impl HealController {
    pub fn new(
        config: ConfigHandle<ClientConfig>,
        prober: Arc<dyn Prober>,
        control: Arc<dyn OverlayControl>,
        reporter: Arc<dyn AddressReporter>,
    ) -> Self {
        let current = config.current();
        let mut state = HealState::from_config(&current);
        if current.auto_heal_enabled {
            state.enable(Instant::now());
        }
        let (enabled, _) = watch::channel(current.auto_heal_enabled);
        Self {
            config,
            prober,
            control,
            reporter,
            state: Mutex::new(state),
            gate: tokio::sync::Mutex::new(()),
            enabled,
            last_report: Mutex::new(None),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.state();
            if enabled {
                state.enable(Instant::now());
            } else {
                state.disable();
            }
        }
        self.enabled.send_replace(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn phase(&self) -> HealPhase {
        self.state().phase()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.state().snapshot()
    }

    pub fn last_report(&self) -> Option<RemediationReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Monitor the target until `shutdown` fires. Disabling pauses probing
    /// without leaving the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut enabled = self.enabled.subscribe();
        let mut reloads = self.config.subscribe();
        let mut configured = self.config.current().auto_heal_enabled;
        let mut log = LoopLog::default();
        info!("auto-heal loop started");

        loop {
            let config = self.config.current();
            self.state().configure(&config);
            if config.auto_heal_enabled != configured {
                configured = config.auto_heal_enabled;
                info!(enabled = configured, "auto_heal_enabled changed in configuration");
                self.set_enabled(configured);
            }

            let active = *enabled.borrow_and_update();
            if active {
                self.iteration(&config, &mut log).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(config.ping_interval()) => {}
                _ = enabled.changed() => {}
                _ = reloads.wait_for(|c| c.auto_heal_enabled != configured) => {}
                _ = shutdown.changed() => break,
            }
        }

        // Waits out a manual remediation still in flight.
        let _gate = self.gate.lock().await;
        self.state().disable();
        info!("auto-heal loop stopped");
    }

    /// Run the remediation sequence now, regardless of threshold or
    /// cooldown. Refused while another remediation is running.
    pub async fn run_now(&self) -> HealResult<RemediationReport> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Err(HealError::RemediationInProgress);
        };
        if !self.state().begin_manual() {
            return Err(HealError::RemediationInProgress);
        }
        info!("manual remediation requested");
        Ok(self.remediate().await)
    }

    async fn iteration(&self, config: &ClientConfig, log: &mut LoopLog) {
        let target = config.target_address.trim();
        if target.is_empty() {
            if !log.warned_no_target {
                warn!("no target address configured, auto-heal paused");
                log.warned_no_target = true;
            }
            return;
        }
        log.warned_no_target = false;

        let timeout = config.ping_timeout();
        let outcome = tokio::time::timeout(probe_deadline(timeout), self.prober.probe(target, timeout))
            .await
            .unwrap_or(ProbeOutcome::TimedOut);
        let ok = outcome.is_reachable();

        let decision = self.state().observe(ok, Instant::now());
        log.record(target, ok, &decision);

        if let Decision::Remediate { failures } = decision {
            warn!(%target, failures, "target unreachable, starting remediation");
            let _gate = self.gate.lock().await;
            self.remediate().await;
        }
    }

    /// Run the sequence and close it out in the state machine. The caller
    /// holds the gate and has put the state into `Remediating`.
    async fn remediate(&self) -> RemediationReport {
        let config = self.config.current();
        let sequence = RemediationSequence::new(
            Arc::clone(&self.control),
            Arc::clone(&self.reporter),
            config.step_timeout(),
            config.step_pause(),
        );
        let report = sequence.run().await;

        let cooldown = self
            .state()
            .finish_remediation(report.succeeded(), Instant::now());
        debug!(?cooldown, "cooldown started");
        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    fn state(&self) -> MutexGuard<'_, HealState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps the loop quiet: status is logged on a change of reachability or
/// every 10th consecutive failure.
#[derive(Default)]
struct LoopLog {
    last_ok: Option<bool>,
    warned_no_target: bool,
}

impl LoopLog {
    fn record(&mut self, target: &str, ok: bool, decision: &Decision) {
        let changed = self.last_ok != Some(ok);
        self.last_ok = Some(ok);
        match decision {
            Decision::Degraded { failures }
            | Decision::Suppressed { failures }
            | Decision::Exhausted { failures }
                if changed || failures % 10 == 0 =>
            {
                info!(%target, failures, ?decision, "target unreachable");
            }
            Decision::Healthy if changed => info!(%target, "target reachable"),
            _ => debug!(%target, ok, "target probed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::remediation::RemediationStep;
    use crate::remediation::tests::{FakeControl, FakeReporter};

    struct SwitchProber {
        up: AtomicBool,
        probes: AtomicU32,
    }

    impl SwitchProber {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                up: AtomicBool::new(up),
                probes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Prober for SwitchProber {
        async fn probe(&self, _address: &str, _timeout: Duration) -> ProbeOutcome {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                ProbeOutcome::Reachable
            } else {
                ProbeOutcome::Unreachable
            }
        }
    }

    fn test_config(threshold: u32) -> ConfigHandle<ClientConfig> {
        ConfigHandle::new(ClientConfig {
            target_address: "10.147.17.1".to_string(),
            ping_interval_secs: 20,
            failure_threshold: threshold,
            cooldown_secs: 60,
            max_cooldown_secs: 600,
            step_timeout_secs: 30,
            step_pause_millis: 1000,
            ..ClientConfig::default()
        })
    }

    fn spawn_loop(controller: &Arc<HealController>) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let controller = Arc::clone(controller);
        let handle = tokio::spawn(async move { controller.run(rx).await });
        (tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn disable_mid_remediation_still_reregisters() {
        let control = Arc::new(FakeControl {
            latency: Duration::from_secs(5),
            ..FakeControl::default()
        });
        let reporter = Arc::new(FakeReporter::default());
        let controller = Arc::new(HealController::new(
            test_config(1),
            SwitchProber::new(false),
            control.clone(),
            reporter.clone(),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.phase(), HealPhase::Remediating);

        controller.set_enabled(false);
        assert_eq!(controller.phase(), HealPhase::Remediating);
        assert_eq!(*reporter.reports.lock().unwrap(), 0);

        // Four 5s steps plus pauses finish well inside a minute.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 1);
        assert_eq!(control.calls.lock().unwrap().len(), 4);
        assert_eq!(controller.phase(), HealPhase::Idle);
        assert!(controller.last_report().unwrap().succeeded());

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_then_cooldown_then_refire() {
        let control = Arc::new(FakeControl::default());
        let reporter = Arc::new(FakeReporter::default());
        let controller = Arc::new(HealController::new(
            test_config(3),
            SwitchProber::new(false),
            control,
            reporter.clone(),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        // Probes at 0s, 20s, 40s: the third crosses the threshold.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 0);
        assert_eq!(controller.snapshot().consecutive_failures, 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 1);
        assert_eq!(controller.phase(), HealPhase::Cooldown);

        // Finished at 44s with a 60s cooldown. Probes at 64s and 84s are
        // suppressed; the one at 104s is the third since firing.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 2);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(controller.phase(), HealPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_target_never_remediates() {
        let reporter = Arc::new(FakeReporter::default());
        let prober = SwitchProber::new(true);
        let controller = Arc::new(HealController::new(
            test_config(1),
            prober.clone(),
            Arc::new(FakeControl::default()),
            reporter.clone(),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(130)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap();

        assert!(prober.probes.load(Ordering::SeqCst) >= 6);
        assert_eq!(*reporter.reports.lock().unwrap(), 0);
        assert_eq!(controller.snapshot().last_ping_ok, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_run_is_exclusive_with_running_remediation() {
        let control = Arc::new(FakeControl {
            latency: Duration::from_secs(5),
            ..FakeControl::default()
        });
        let controller = Arc::new(HealController::new(
            test_config(3),
            SwitchProber::new(true),
            control.clone(),
            Arc::new(FakeReporter::default()),
        ));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            controller.run_now().await,
            Err(HealError::RemediationInProgress)
        ));

        let report = first.await.unwrap().unwrap();
        assert!(report.succeeded());
        assert_eq!(control.calls.lock().unwrap().len(), 4);
        assert_eq!(controller.phase(), HealPhase::Cooldown);

        // Manual runs ignore the cooldown once the gate is free.
        let again = controller.run_now().await.unwrap();
        assert_eq!(again.steps.len(), RemediationStep::SEQUENCE.len());
        assert_eq!(controller.snapshot().remediations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_during_automatic_remediation_is_refused() {
        let control = Arc::new(FakeControl {
            latency: Duration::from_secs(5),
            ..FakeControl::default()
        });
        let reporter = Arc::new(FakeReporter::default());
        let controller = Arc::new(HealController::new(
            test_config(1),
            SwitchProber::new(false),
            control.clone(),
            reporter.clone(),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.phase(), HealPhase::Remediating);
        assert!(matches!(
            controller.run_now().await,
            Err(HealError::RemediationInProgress)
        ));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(*reporter.reports.lock().unwrap(), 1);
        assert_eq!(control.calls.lock().unwrap().len(), 4);
        assert_eq!(control.peak.load(Ordering::SeqCst), 1);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reloaded_config_toggles_auto_heal() {
        let prober = SwitchProber::new(true);
        let config = test_config(1);
        let controller = Arc::new(HealController::new(
            config.clone(),
            prober.clone(),
            Arc::new(FakeControl::default()),
            Arc::new(FakeReporter::default()),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);

        config.update(|c| c.auto_heal_enabled = false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!controller.is_enabled());
        assert_eq!(controller.phase(), HealPhase::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);

        config.update(|c| c.auto_heal_enabled = true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.is_enabled());
        assert_eq!(controller.phase(), HealPhase::Monitoring);
        assert_eq!(prober.probes.load(Ordering::SeqCst), 2);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reloaded_disable_mid_remediation_lets_sequence_finish() {
        let control = Arc::new(FakeControl {
            latency: Duration::from_secs(5),
            ..FakeControl::default()
        });
        let reporter = Arc::new(FakeReporter::default());
        let config = test_config(1);
        let controller = Arc::new(HealController::new(
            config.clone(),
            SwitchProber::new(false),
            control.clone(),
            reporter.clone(),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.phase(), HealPhase::Remediating);

        config.update(|c| c.auto_heal_enabled = false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.phase(), HealPhase::Remediating);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(control.calls.lock().unwrap().len(), 4);
        assert_eq!(*reporter.reports.lock().unwrap(), 1);
        assert!(!controller.is_enabled());
        assert_eq!(controller.phase(), HealPhase::Idle);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failed_remediations_stand_down_until_target_answers() {
        let control = Arc::new(FakeControl {
            failing: RemediationStep::SEQUENCE[..4].to_vec(),
            ..FakeControl::default()
        });
        let prober = SwitchProber::new(false);
        let config = test_config(1);
        config.update(|c| c.max_failed_remediations = 2);
        let controller = Arc::new(HealController::new(
            config,
            prober.clone(),
            control,
            Arc::new(FakeReporter::default()),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(600)).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.remediations, 2);
        assert_eq!(snapshot.failed_remediations, 2);
        assert!(snapshot.exhausted);

        prober.up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!controller.snapshot().exhausted);
        assert_eq!(controller.snapshot().remediations, 2);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reregistration_marks_report_failed() {
        let controller = HealController::new(
            test_config(1),
            SwitchProber::new(true),
            Arc::new(FakeControl::default()),
            Arc::new(FakeReporter {
                fail: true,
                ..FakeReporter::default()
            }),
        );
        let report = controller.run_now().await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(controller.snapshot().failed_remediations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_target_pauses_probing() {
        let prober = SwitchProber::new(false);
        let config = test_config(1);
        config.update(|c| c.target_address.clear());
        let controller = Arc::new(HealController::new(
            config,
            prober.clone(),
            Arc::new(FakeControl::default()),
            Arc::new(FakeReporter::default()),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(70)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
        assert_eq!(controller.snapshot().remediations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_controller_does_not_probe_until_enabled() {
        let prober = SwitchProber::new(true);
        let config = test_config(1);
        config.update(|c| c.auto_heal_enabled = false);
        let controller = Arc::new(HealController::new(
            config,
            prober.clone(),
            Arc::new(FakeControl::default()),
            Arc::new(FakeReporter::default()),
        ));
        let (shutdown, handle) = spawn_loop(&controller);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
        assert_eq!(controller.phase(), HealPhase::Idle);

        controller.set_enabled(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
        assert_eq!(controller.phase(), HealPhase::Monitoring);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }
}
