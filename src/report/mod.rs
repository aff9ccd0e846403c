// SPDX-License-Identifier: MIT
pub mod text;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{EndReason, Session, SessionId};
use crate::telemetry::TelemetryReading;
use crate::workload::UnitStatus;

const NANOS_PER_MILLI: f64 = 1_000_000.0;
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricSummary {
    NoData,
    Summary(Stats),
}

impl MetricSummary {
    /// Summarizes `values`. Sorts with a total order, so NaN cannot break
    /// it; percentiles are nearest-rank.
    #[must_use]
    pub fn of(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::NoData;
        }
        values.sort_by(f64::total_cmp);

        #[allow(clippy::cast_precision_loss)]
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Self::Summary(Stats {
            min: values[0],
            max: values[values.len() - 1],
            mean,
            p50: nearest_rank(&values, 50),
            p95: nearest_rank(&values, 95),
            p99: nearest_rank(&values, 99),
        })
    }

    #[must_use]
    pub fn stats(&self) -> Option<&Stats> {
        match self {
            Self::NoData => None,
            Self::Summary(stats) => Some(stats),
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: usize) -> f64 {
    let rank = (percentile * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub utilization_pct: MetricSummary,
    pub temperature_c: MetricSummary,
    pub clock_mhz: MetricSummary,
    pub power_w: MetricSummary,
    pub memory_used_mb: MetricSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub end_reason: EndReason,
    pub degraded: bool,
    /// From session start to finalize, on the monotonic session clock.
    pub wall_clock: Duration,
    /// Time spent under load.
    pub running: Duration,

    pub telemetry: TelemetrySummary,
    pub readings: u64,
    pub stale_readings: u64,
    pub largest_gap: Option<Duration>,
    /// Gaps longer than twice the sample interval.
    pub gap_violations: u64,

    /// Completed units only.
    pub iteration_ms: MetricSummary,
    pub total_iterations: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub iterations_per_sec: f64,
}

/// Builds the report for a finalized session. Pure: the same session
/// always yields an identical report.
#[must_use]
pub fn finalize(session: &Session) -> SessionReport {
    let readings = session.readings();
    let events = session.events();
    let outcome = session.outcome();

    let running = outcome
        .running_started_ns
        .map_or(Duration::ZERO, |start| {
            Duration::from_nanos(outcome.finished_ns.saturating_sub(start))
        });

    let mut completed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut iteration_ms = Vec::with_capacity(events.len());
    for event in events {
        match event.status {
            UnitStatus::Completed => {
                completed += 1;
                #[allow(clippy::cast_precision_loss)]
                iteration_ms.push(event.duration_ns as f64 / NANOS_PER_MILLI);
            }
            UnitStatus::Failed => failed += 1,
            UnitStatus::Skipped => skipped += 1,
        }
    }
    let total_iterations = events.len() as u64;

    let iterations_per_sec = if running.is_zero() {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let n = total_iterations as f64;
        #[allow(clippy::cast_precision_loss)]
        let secs = running.as_nanos() as f64 / NANOS_PER_SECOND;
        n / secs
    };

    let interval_ns = session.config().sample_interval_ms.saturating_mul(1_000_000);
    let gaps: Vec<u64> = readings
        .windows(2)
        .map(|w| w[1].timestamp_ns.saturating_sub(w[0].timestamp_ns))
        .collect();

    SessionReport {
        session_id: session.id(),
        end_reason: outcome.end_reason,
        degraded: outcome.degraded,
        wall_clock: Duration::from_nanos(outcome.finished_ns),
        running,
        telemetry: summarize_telemetry(readings),
        readings: readings.len() as u64,
        stale_readings: readings.iter().filter(|r| r.stale).count() as u64,
        largest_gap: gaps.iter().max().copied().map(Duration::from_nanos),
        gap_violations: gaps
            .iter()
            .filter(|&&gap| gap > interval_ns.saturating_mul(2))
            .count() as u64,
        iteration_ms: MetricSummary::of(iteration_ms),
        total_iterations,
        completed,
        failed,
        skipped,
        iterations_per_sec,
    }
}

/// Stale readings repeat earlier values and would skew the statistics, so
/// only fresh ones are summarized. Unavailable (NaN) values are skipped per
/// metric.
fn summarize_telemetry(readings: &[TelemetryReading]) -> TelemetrySummary {
    let fresh: Vec<&TelemetryReading> = readings.iter().filter(|r| !r.stale).collect();
    let metric = |field: fn(&TelemetryReading) -> f32| {
        MetricSummary::of(
            fresh
                .iter()
                .map(|r| field(r))
                .filter(|v| !v.is_nan())
                .map(f64::from)
                .collect(),
        )
    };
    TelemetrySummary {
        utilization_pct: metric(|r| r.utilization_pct),
        temperature_c: metric(|r| r.temperature_c),
        clock_mhz: metric(|r| r.clock_mhz),
        power_w: metric(|r| r.power_w),
        memory_used_mb: metric(|r| r.memory_used_mb),
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{Outcome, SessionMetadata, TransitionRecord};
    use crate::sync::state::Phase;
    use crate::telemetry::SensorValues;
    use crate::workload::WorkloadEvent;

    fn session(readings: Vec<TelemetryReading>, events: Vec<WorkloadEvent>) -> Session {
        let config = SessionConfig {
            sample_interval_ms: 100,
            ..SessionConfig::default()
        };
        Session::from_parts(
            SessionMetadata {
                session_id: SessionId::generate(),
                started_at: SystemTime::UNIX_EPOCH,
                sensor: "test".into(),
                workload_backend: "test".into(),
                config,
            },
            readings,
            events,
            vec![
                TransitionRecord {
                    phase: Phase::Running,
                    at_ns: 0,
                },
                TransitionRecord {
                    phase: Phase::Finalized,
                    at_ns: 2_000_000_000,
                },
            ],
            Outcome {
                end_reason: EndReason::DurationElapsed,
                degraded: false,
                ended_at: SystemTime::UNIX_EPOCH,
                running_started_ns: Some(0),
                finished_ns: 2_000_000_000,
            },
        )
    }

    fn reading(ms: u64, temperature_c: f32, stale: bool) -> TelemetryReading {
        TelemetryReading::new(
            ms * 1_000_000,
            SensorValues {
                temperature_c,
                ..SensorValues::default()
            },
            stale,
        )
    }

    fn event(iteration: u64, duration_ms: u64, status: UnitStatus) -> WorkloadEvent {
        WorkloadEvent {
            timestamp_ns: iteration * 1_000_000,
            iteration,
            duration_ns: duration_ms * 1_000_000,
            status,
        }
    }

    #[test]
    fn empty_session_reports_no_data() {
        let report = finalize(&session(vec![], vec![]));
        for summary in [
            report.telemetry.utilization_pct,
            report.telemetry.temperature_c,
            report.telemetry.clock_mhz,
            report.telemetry.power_w,
            report.telemetry.memory_used_mb,
            report.iteration_ms,
        ] {
            assert_eq!(summary, MetricSummary::NoData);
        }
        assert_eq!(report.total_iterations, 0);
        assert_eq!(report.largest_gap, None);
        assert!(report.iterations_per_sec.abs() < f64::EPSILON);
    }

    #[test]
    fn nearest_rank_percentiles() {
        let values: Vec<f64> = (1..=100).rev().map(f64::from).collect();
        let stats = *MetricSummary::of(values).stats().unwrap();
        assert!((stats.min - 1.0).abs() < f64::EPSILON);
        assert!((stats.max - 100.0).abs() < f64::EPSILON);
        assert!((stats.mean - 50.5).abs() < 1e-9);
        assert!((stats.p50 - 50.0).abs() < f64::EPSILON);
        assert!((stats.p95 - 95.0).abs() < f64::EPSILON);
        assert!((stats.p99 - 99.0).abs() < f64::EPSILON);

        let single = *MetricSummary::of(vec![7.0]).stats().unwrap();
        assert!((single.p99 - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_readings_are_counted_but_not_summarized() {
        let report = finalize(&session(
            vec![
                reading(0, 40.0, false),
                reading(100, 99.0, true),
                reading(200, 60.0, false),
            ],
            vec![],
        ));
        assert_eq!(report.readings, 3);
        assert_eq!(report.stale_readings, 1);
        let temp = report.telemetry.temperature_c.stats().copied().unwrap();
        assert!((temp.max - 60.0).abs() < f64::EPSILON);
        assert!((temp.mean - 50.0).abs() < 1e-6);
    }

    #[test]
    fn iteration_stats_use_completed_units_only() {
        let report = finalize(&session(
            vec![],
            vec![
                event(0, 10, UnitStatus::Completed),
                event(1, 2000, UnitStatus::Failed),
                event(2, 0, UnitStatus::Skipped),
                event(3, 30, UnitStatus::Completed),
            ],
        ));
        assert_eq!(report.total_iterations, 4);
        assert_eq!((report.completed, report.failed, report.skipped), (2, 1, 1));
        let stats = report.iteration_ms.stats().copied().unwrap();
        assert!((stats.max - 30.0).abs() < 1e-9);
        assert!((stats.mean - 20.0).abs() < 1e-9);
        assert!((report.iterations_per_sec - 2.0).abs() < 1e-9);
    }

    #[test]
    fn gaps_beyond_twice_the_interval_are_flagged() {
        let report = finalize(&session(
            vec![
                reading(0, 40.0, false),
                reading(100, 40.0, false),
                reading(350, 40.0, false),
                reading(450, 40.0, false),
            ],
            vec![],
        ));
        assert_eq!(report.largest_gap, Some(Duration::from_millis(250)));
        assert_eq!(report.gap_violations, 1);
    }

    #[test]
    fn finalize_is_idempotent() {
        let s = session(
            vec![reading(0, 40.0, false), reading(100, 45.0, false)],
            vec![event(0, 5, UnitStatus::Completed)],
        );
        assert_eq!(finalize(&s), finalize(&s));
    }

    #[test]
    fn unavailable_metrics_report_no_data() {
        let mut partial = reading(0, 50.0, false);
        partial.power_w = f32::NAN;
        partial.clock_mhz = f32::NAN;
        let mut full = reading(100, 60.0, false);
        full.clock_mhz = 1500.0;
        full.power_w = f32::NAN;

        let report = finalize(&session(vec![partial, full], vec![]));
        assert_eq!(report.telemetry.power_w, MetricSummary::NoData);
        let clock = report.telemetry.clock_mhz.stats().copied().unwrap();
        assert!((clock.min - 1500.0).abs() < f64::EPSILON);
        assert!((clock.max - 1500.0).abs() < f64::EPSILON);
        assert_eq!(report.readings, 2);
    }

    #[test]
    fn out_of_order_timestamps_do_not_panic() {
        let report = finalize(&session(
            vec![reading(200, 40.0, false), reading(100, 40.0, false)],
            vec![],
        ));
        assert_eq!(report.largest_gap, Some(Duration::ZERO));
        assert_eq!(report.gap_violations, 0);
    }
}
