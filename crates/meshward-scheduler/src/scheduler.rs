//! PingScheduler: staggered, bounded probing of every registered client.
//!
//! Each tick re-reads the configuration, snapshots the registry, and
//! spawns one task per client that sleeps until the client's phase
//! offset, waits for a probe permit, probes, and reports the result back
//! to the registry.
//!
//! Guarantees:
//! - at most `max_concurrent_probes` probes run at once (semaphore);
//! - an identity is never queued or probed twice at the same time (claim
//!   set); a tick that finds a previous probe still pending skips it;
//! - every exit path (success, failure, timeout, abort on shutdown) drops
//!   the claim, the permit, and the in-flight slot;
//! - every dispatched probe settles exactly once in the metrics, as
//!   completed, discarded or abandoned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use meshward_core::{ConfigHandle, ServerConfig, epoch_secs};
use meshward_metrics::ProbeMetrics;
use meshward_registry::ClientRegistry;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::probe::{ProbeOutcome, Prober, probe_deadline};
use crate::slot::ScheduleSlot;

type ClaimSet = Arc<Mutex<HashSet<String>>>;

pub struct PingScheduler {
    registry: Arc<ClientRegistry>,
    config: ConfigHandle<ServerConfig>,
    prober: Arc<dyn Prober>,
    metrics: Arc<ProbeMetrics>,
    permits: Arc<Semaphore>,
    /// Permits the semaphore is currently sized for.
    bound: Mutex<usize>,
    claims: ClaimSet,
    last_tick: Mutex<Option<Instant>>,
}

impl PingScheduler {
    pub fn new(
        registry: Arc<ClientRegistry>,
        config: ConfigHandle<ServerConfig>,
        prober: Arc<dyn Prober>,
        metrics: Arc<ProbeMetrics>,
    ) -> Self {
        let bound = config.current().max_concurrent_probes.max(1);
        Self {
            registry,
            config,
            prober,
            metrics,
            permits: Arc::new(Semaphore::new(bound)),
            bound: Mutex::new(bound),
            claims: Arc::new(Mutex::new(HashSet::new())),
            last_tick: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<ProbeMetrics> {
        &self.metrics
    }

    /// True while the tick loop has started a cycle within the last two
    /// intervals.
    pub fn health(&self) -> bool {
        let interval = self.config.current().ping_interval();
        match *lock(&self.last_tick) {
            Some(at) => at.elapsed() <= interval * 2,
            None => false,
        }
    }

    /// Seconds since the last tick started, if there has been one.
    pub fn last_tick_age(&self) -> Option<Duration> {
        lock(&self.last_tick).map(|at| at.elapsed())
    }

    /// Run the tick loop until `shutdown` fires. Pending probes are
    /// abandoned on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        info!(
            interval = ?self.config.current().ping_interval(),
            "ping scheduler started"
        );

        loop {
            let config = self.config.current();
            self.tick(&config, &mut tasks);
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = tokio::time::sleep(config.ping_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }

        let abandoned = tasks.len();
        tasks.shutdown().await;
        info!(abandoned, "ping scheduler stopped");
    }

    /// Run exactly one cycle and wait for every probe it dispatched.
    #[cfg(test)]
    async fn probe_all(&self) {
        let config = self.config.current();
        let mut tasks = JoinSet::new();
        self.tick(&config, &mut tasks);
        while tasks.join_next().await.is_some() {}
    }

    fn tick(&self, config: &ServerConfig, tasks: &mut JoinSet<()>) {
        *lock(&self.last_tick) = Some(Instant::now());
        self.metrics.tick();
        self.resize(config.max_concurrent_probes);

        let interval = config.ping_interval();
        let timeout = config.ping_timeout();
        let records = self.registry.snapshot();
        let mut dispatched = 0usize;

        for record in records {
            let Some(claim) = Claim::try_new(&self.claims, &record.identity) else {
                debug!(identity = %record.identity, "previous probe still pending, skipping");
                self.metrics.probe_skipped();
                continue;
            };
            self.metrics.probe_submitted();
            dispatched += 1;

            let slot = ScheduleSlot::derive(&record.identity, interval);
            let job = ProbeJob {
                delay: slot.offset,
                timeout,
                identity: slot.identity,
                registry: Arc::clone(&self.registry),
                prober: Arc::clone(&self.prober),
                metrics: Arc::clone(&self.metrics),
                permits: Arc::clone(&self.permits),
            };
            tasks.spawn(job.run(claim));
        }

        debug!(dispatched, in_flight = self.metrics.in_flight(), "tick dispatched");
    }

    /// Match the semaphore to a (possibly reloaded) concurrency bound.
    fn resize(&self, wanted: usize) {
        let wanted = wanted.max(1);
        let mut bound = lock(&self.bound);
        if wanted == *bound {
            return;
        }
        if wanted > *bound {
            self.permits.add_permits(wanted - *bound);
        } else {
            // Retire permits as probes hand them back.
            let excess = u32::try_from(*bound - wanted).unwrap_or(u32::MAX);
            let permits = Arc::clone(&self.permits);
            tokio::spawn(async move {
                if let Ok(retired) = permits.acquire_many_owned(excess).await {
                    retired.forget();
                }
            });
        }
        info!(from = *bound, to = wanted, "probe concurrency changed");
        *bound = wanted;
    }
}

struct ProbeJob {
    identity: String,
    delay: Duration,
    timeout: Duration,
    registry: Arc<ClientRegistry>,
    prober: Arc<dyn Prober>,
    metrics: Arc<ProbeMetrics>,
    permits: Arc<Semaphore>,
}

impl ProbeJob {
    async fn run(self, _claim: Claim) {
        let outstanding = Outstanding::new(&self.metrics);
        tokio::time::sleep(self.delay).await;

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let _slot = self.metrics.enter();

        // The client may have been forgotten, or moved, while queued.
        let Some(record) = self.registry.get(&self.identity) else {
            outstanding.settle();
            self.metrics.probe_discarded();
            return;
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            probe_deadline(self.timeout),
            self.prober.probe(&record.address, self.timeout),
        )
        .await
        .unwrap_or(ProbeOutcome::TimedOut);
        let ok = outcome.is_reachable();

        outstanding.settle();
        if self.registry.record_ping_result(&self.identity, ok, epoch_secs()) {
            self.metrics.probe_completed(started.elapsed(), ok);
            if !ok {
                debug!(identity = %self.identity, address = %record.address, ?outcome, "probe failed");
            }
        } else {
            self.metrics.probe_discarded();
            debug!(identity = %self.identity, "client removed during probe, result discarded");
        }
    }
}

/// Counts a dispatched probe as abandoned if it is dropped unsettled.
struct Outstanding {
    metrics: Arc<ProbeMetrics>,
    settled: bool,
}

impl Outstanding {
    fn new(metrics: &Arc<ProbeMetrics>) -> Self {
        Self {
            metrics: Arc::clone(metrics),
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.probe_abandoned();
        }
    }
}

/// Exclusive claim on one identity for the lifetime of its probe task.
struct Claim {
    claims: ClaimSet,
    identity: String,
}

impl Claim {
    fn try_new(claims: &ClaimSet, identity: &str) -> Option<Self> {
        if !lock(claims).insert(identity.to_string()) {
            return None;
        }
        Some(Self {
            claims: Arc::clone(claims),
            identity: identity.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !lock(&self.claims).remove(&self.identity) {
            warn!(identity = %self.identity, "probe claim already released");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
