//! Reachability probe backends.
//!
//! Probes never return errors: a failure to run the probe at all is just
//! another way of not reaching the host.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshward_core::ProbeKind;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, error};

/// Extra time granted to a probe beyond its own deadline, covering
/// process startup for the `ping` backend.
const PROCESS_GRACE: Duration = Duration::from_secs(2);

/// Outer deadline for a probe given `timeout`. Callers that wrap
/// `Prober::probe` in their own timeout use this, so a backend that
/// honours `timeout` is never cut short.
pub fn probe_deadline(timeout: Duration) -> Duration {
    timeout + PROCESS_GRACE
}

/// Result of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    /// The host answered negatively, or the probe could not be sent.
    Unreachable,
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_reachable(self) -> bool {
        self == ProbeOutcome::Reachable
    }
}

/// Something that can check whether an address answers.
///
/// Implementations must honour `timeout` themselves; callers wrap them in
/// an outer timeout of [`probe_deadline`] as well.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome;
}

/// Build the prober selected by the server configuration.
pub fn prober_for(kind: ProbeKind, tcp_port: u16) -> Arc<dyn Prober> {
    match kind {
        ProbeKind::Icmp => Arc::new(PingProber),
        ProbeKind::Tcp => Arc::new(TcpProber::new(tcp_port)),
    }
}

/// One ICMP echo through the system `ping` binary.
///
/// Success is judged by exit status only, so localized output does not
/// matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProber;

impl PingProber {
    fn command(address: &str, timeout: Duration) -> Command {
        let ipv6 = matches!(address.parse::<IpAddr>(), Ok(IpAddr::V6(_)));
        let secs = timeout.as_secs().max(1);
        let millis = (timeout.as_millis() as u64).max(1);

        let mut cmd = Command::new("ping");
        if ipv6 {
            cmd.arg("-6");
        }
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w"]).arg(millis.to_string());
        } else if cfg!(target_os = "macos") {
            cmd.args(["-c", "1", "-W"]).arg(millis.to_string());
        } else {
            cmd.args(["-c", "1", "-W"]).arg(secs.to_string());
        }
        cmd.arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome {
        // Never let an address be read as a ping option.
        if address.is_empty() || address.starts_with('-') {
            debug!(%address, "refusing to ping malformed address");
            return ProbeOutcome::Unreachable;
        }

        let mut cmd = Self::command(address, timeout);
        match tokio::time::timeout(probe_deadline(timeout), cmd.status()).await {
            Ok(Ok(status)) if status.success() => ProbeOutcome::Reachable,
            Ok(Ok(status)) => {
                debug!(%address, code = ?status.code(), "ping failed");
                ProbeOutcome::Unreachable
            }
            Ok(Err(e)) => {
                error!(%address, error = %e, "could not run ping");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(%address, "ping timed out");
                ProbeOutcome::TimedOut
            }
        }
    }
}

/// TCP connect to a fixed port; a completed handshake counts as reachable.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    port: u16,
}

impl TcpProber {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, TcpStream::connect((address, self.port))).await {
            Ok(Ok(_)) => ProbeOutcome::Reachable,
            Ok(Err(e)) => {
                debug!(%address, port = self.port, error = %e, "tcp probe failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(%address, port = self.port, "tcp probe timed out");
                ProbeOutcome::TimedOut
            }
        }
    }
}
