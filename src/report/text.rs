// SPDX-License-Identifier: MIT
use std::io::{self, Write};

use num_format::{Locale, ToFormattedString};

use super::{MetricSummary, SessionReport};
use crate::session::SessionMetadata;

/// Writes the human-readable report.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn write_report(
    out: &mut impl Write,
    metadata: &SessionMetadata,
    report: &SessionReport,
) -> io::Result<()> {
    let count = |n: u64| n.to_formatted_string(&Locale::en);

    writeln!(out, "Session {}", report.session_id)?;
    writeln!(
        out,
        "  sensor: {}   workload: {} ({}, size {}, {} passes)",
        metadata.sensor,
        metadata.workload_backend,
        metadata.config.workload.kind,
        metadata.config.workload.work_size.to_formatted_string(&Locale::en),
        metadata.config.workload.passes
    )?;
    let status = if report.degraded { "  [DEGRADED]" } else { "" };
    writeln!(out, "  ended: {}{status}", report.end_reason)?;
    writeln!(
        out,
        "  duration: {:.2}s total, {:.2}s under load",
        report.wall_clock.as_secs_f64(),
        report.running.as_secs_f64()
    )?;
    writeln!(out)?;

    writeln!(
        out,
        "Workload: {} iterations ({} completed, {} failed, {} skipped), {:.1} it/s",
        count(report.total_iterations),
        count(report.completed),
        count(report.failed),
        count(report.skipped),
        report.iterations_per_sec
    )?;
    write_metric(out, "iteration (ms)", &report.iteration_ms)?;
    writeln!(out)?;

    let gap = report
        .largest_gap
        .map_or_else(|| "-".to_string(), |g| format!("{:.0}ms", g.as_secs_f64() * 1000.0));
    writeln!(
        out,
        "Telemetry: {} readings ({} stale), largest gap {gap}, {} gap violation(s)",
        count(report.readings),
        count(report.stale_readings),
        count(report.gap_violations)
    )?;
    writeln!(
        out,
        "  {:<16} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "metric", "min", "mean", "p50", "p95", "p99", "max"
    )?;
    let t = &report.telemetry;
    write_metric(out, "utilization (%)", &t.utilization_pct)?;
    write_metric(out, "temperature (C)", &t.temperature_c)?;
    write_metric(out, "clock (MHz)", &t.clock_mhz)?;
    write_metric(out, "power (W)", &t.power_w)?;
    write_metric(out, "memory (MB)", &t.memory_used_mb)?;
    Ok(())
}

fn write_metric(out: &mut impl Write, label: &str, summary: &MetricSummary) -> io::Result<()> {
    match summary.stats() {
        None => writeln!(out, "  {label:<16} no data"),
        Some(s) => writeln!(
            out,
            "  {label:<16} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
            s.min, s.mean, s.p50, s.p95, s.p99, s.max
        ),
    }
}
