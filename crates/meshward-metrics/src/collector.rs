//! Probe counters shared between the scheduler and the API.
//!
//! Lock-free: every counter is an atomic. In-flight accounting goes
//! through [`InFlightGuard`], whose `Drop` releases the slot, so a probe
//! that fails, times out or is aborted still gives its slot back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ProbeMetrics {
    ticks: AtomicU64,
    submitted: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    abandoned: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    duration_micros: AtomicU64,
}

/// Point-in-time copy of [`ProbeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeMetricsSnapshot {
    pub ticks: u64,
    pub submitted: u64,
    /// Dispatches dropped because the identity was already queued or probing.
    pub skipped: u64,
    /// Probes whose result was applied to the registry.
    pub completed: u64,
    pub failed: u64,
    /// Results dropped because the client left the registry mid-probe.
    pub discarded: u64,
    /// Dispatched probes dropped unfinished at shutdown.
    pub abandoned: u64,
    pub acquired: u64,
    pub released: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub duration_micros: u64,
}

impl ProbeMetricsSnapshot {
    /// Probes queued or running that have not settled yet.
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.discarded)
            .saturating_sub(self.abandoned)
    }

    /// Share of applied results that found the client reachable.
    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        (self.completed - self.failed) as f64 / self.completed as f64
    }

    pub fn avg_duration(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.duration_micros / self.completed)
    }
}

impl ProbeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A probe produced a result that was applied to the registry.
    pub fn probe_completed(&self, duration: Duration, ok: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A probe finished but its client had been removed meanwhile.
    pub fn probe_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatched probe was dropped before it could settle.
    pub fn probe_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Take an in-flight slot. The slot is returned when the guard drops.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProbeMetricsSnapshot {
        ProbeMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
            duration_micros: self.duration_micros.load(Ordering::Relaxed),
        }
    }
}

/// Holds one in-flight slot of a [`ProbeMetrics`].
#[derive(Debug)]
pub struct InFlightGuard {
    metrics: Arc<ProbeMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_peak_and_releases() {
        let metrics = ProbeMetrics::new();
        let a = metrics.enter();
        let b = metrics.enter();
        assert_eq!(metrics.in_flight(), 2);
        drop(a);
        let c = metrics.enter();
        drop(b);
        drop(c);

        let snap = metrics.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.peak_in_flight, 2);
        assert_eq!(snap.acquired, 3);
        assert_eq!(snap.released, 3);
    }

    #[test]
    fn success_rate_and_average() {
        let metrics = ProbeMetrics::new();
        for _ in 0..4 {
            metrics.probe_submitted();
        }
        metrics.probe_completed(Duration::from_millis(10), true);
        metrics.probe_completed(Duration::from_millis(30), false);

        let snap = metrics.snapshot();
        assert_eq!(snap.pending(), 2);
        assert!((snap.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.avg_duration(), Duration::from_millis(20));
    }

    #[test]
    fn discarded_and_abandoned_settle_without_skewing_rates() {
        let metrics = ProbeMetrics::new();
        for _ in 0..5 {
            metrics.probe_submitted();
        }
        metrics.probe_completed(Duration::from_millis(40), true);
        metrics.probe_completed(Duration::from_millis(20), false);
        metrics.probe_discarded();
        metrics.probe_discarded();
        assert_eq!(metrics.snapshot().pending(), 1);

        metrics.probe_abandoned();
        let snap = metrics.snapshot();
        assert_eq!(snap.pending(), 0);
        assert_eq!(snap.completed, 2);
        assert!((snap.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.avg_duration(), Duration::from_millis(30));
    }

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let snap = ProbeMetrics::new().snapshot();
        assert_eq!(snap.success_rate(), 0.0);
        assert_eq!(snap.avg_duration(), Duration::ZERO);
    }
}
