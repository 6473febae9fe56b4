//! Prometheus text exposition format.

use std::fmt::Write;
use std::time::Duration;

use meshward_registry::ClientStats;

use crate::collector::ProbeMetricsSnapshot;

/// Render registry stats and probe counters for the `/metrics` endpoint.
pub fn render_prometheus(
    stats: &ClientStats,
    probes: &ProbeMetricsSnapshot,
    uptime: Duration,
    scheduler_healthy: bool,
) -> String {
    let mut out = String::new();

    gauge(&mut out, "meshward_uptime_seconds", "Seconds since the daemon started.", uptime.as_secs());
    gauge(
        &mut out,
        "meshward_scheduler_healthy",
        "1 while the probe scheduler is ticking.",
        u64::from(scheduler_healthy),
    );

    out.push_str("# HELP meshward_clients Registered clients by state.\n");
    out.push_str("# TYPE meshward_clients gauge\n");
    for (state, value) in [
        ("total", stats.total),
        ("active", stats.active),
        ("stale", stats.stale),
        ("online", stats.online),
        ("offline", stats.offline),
        ("never_pinged", stats.never_pinged),
    ] {
        let _ = writeln!(out, "meshward_clients{{state=\"{state}\"}} {value}");
    }

    counter(&mut out, "meshward_scheduler_ticks_total", "Probe cycles started.", probes.ticks);
    counter(&mut out, "meshward_probes_submitted_total", "Probes dispatched.", probes.submitted);
    counter(
        &mut out,
        "meshward_probes_skipped_total",
        "Dispatches skipped because the client was already being probed.",
        probes.skipped,
    );
    counter(
        &mut out,
        "meshward_probes_completed_total",
        "Probes whose result was recorded.",
        probes.completed,
    );
    counter(&mut out, "meshward_probes_failed_total", "Probes that found the client unreachable.", probes.failed);
    counter(
        &mut out,
        "meshward_probes_discarded_total",
        "Probe results dropped because the client was removed.",
        probes.discarded,
    );
    counter(
        &mut out,
        "meshward_probes_abandoned_total",
        "Probes dropped unfinished at shutdown.",
        probes.abandoned,
    );
    gauge(&mut out, "meshward_probes_in_flight", "Probes currently running.", probes.in_flight as u64);
    gauge(&mut out, "meshward_probes_pending", "Probes queued or running.", probes.pending());

    out.push_str("# HELP meshward_probe_success_ratio Share of recorded probes that reached the client.\n");
    out.push_str("# TYPE meshward_probe_success_ratio gauge\n");
    let _ = writeln!(out, "meshward_probe_success_ratio {:.4}", probes.success_rate());

    out.push_str("# HELP meshward_probe_duration_seconds_avg Mean probe duration.\n");
    out.push_str("# TYPE meshward_probe_duration_seconds_avg gauge\n");
    let _ = writeln!(
        out,
        "meshward_probe_duration_seconds_avg {:.6}",
        probes.avg_duration().as_secs_f64()
    );

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}
