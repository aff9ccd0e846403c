// SPDX-License-Identifier: MIT
//! Session coordination.
//!
//! [`Synchronizer::start`] validates the config, sets up the session and
//! hands it to a `session-coordinator` thread. That thread is the only one
//! that moves the session through its lifecycle: it warms the sensor up,
//! runs the workload loop and the sampler side by side, watches for stop and
//! abort conditions, and finally settles both loops and builds the report.

pub mod backpressure;
pub mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use self::backpressure::{Backpressure, Yielder};
use self::state::{Phase, PhaseCell, SessionState, Trigger};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::report::{self, SessionReport};
use crate::sampler::{Sampler, SamplerOptions};
use crate::session::arena::{LogWriter, append_log};
use crate::session::{ActiveSession, EndReason, Session, SessionClock, SessionId, SessionMetadata};
use crate::telemetry::{BoundedSource, TelemetryReading, TelemetrySource};
use crate::workload::counters::{ThroughputCounters, ThroughputSnapshot};
use crate::workload::{GeneratorOptions, WorkloadBackend, WorkloadEvent, WorkloadGenerator};

const MIN_MONITOR_POLL: Duration = Duration::from_millis(1);
const MAX_MONITOR_POLL: Duration = Duration::from_millis(20);
const JOIN_POLL: Duration = Duration::from_millis(2);

/// Flags shared between the coordinator, the worker loops and the handle.
#[derive(Debug)]
struct Shared {
    phase: PhaseCell,
    cancel: AtomicBool,
    /// Tells the workload loop to stop issuing units.
    stop_workload: AtomicBool,
    workload_aborted: AtomicBool,
    iteration_limit: AtomicBool,
    events_full: AtomicBool,
    backpressure: Backpressure,
    counters: Arc<ThroughputCounters>,
}

/// The finalized session and its report.
#[derive(Clone, Debug)]
pub struct SessionOutcome {
    pub session: Session,
    pub report: SessionReport,
}

pub struct Synchronizer {
    source: Box<dyn TelemetrySource>,
    backend: Box<dyn WorkloadBackend>,
    counters: Arc<ThroughputCounters>,
}

impl Synchronizer {
    #[cfg(test)]
    #[must_use]
    pub fn new(source: Box<dyn TelemetrySource>, backend: Box<dyn WorkloadBackend>) -> Self {
        Self::with_counters(source, backend, Arc::new(ThroughputCounters::default()))
    }

    /// Uses `counters` for the workload loop, so that something else (such as
    /// a simulated sensor) can observe the same throughput.
    #[must_use]
    pub fn with_counters(
        source: Box<dyn TelemetrySource>,
        backend: Box<dyn WorkloadBackend>,
        counters: Arc<ThroughputCounters>,
    ) -> Self {
        Self {
            source,
            backend,
            counters,
        }
    }

    /// Starts a session. Consumes the synchronizer: a session is never
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] without leaving `Idle` if
    /// `config` is invalid, the backend's error if it cannot be prepared, or
    /// [`Error::ThreadSpawn`].
    pub fn start(self, config: SessionConfig) -> Result<RunningSession> {
        let (mut coordinator, workers) = self.prepare(config)?;
        let shared = Arc::clone(&coordinator.shared);

        let handle = thread::Builder::new()
            .name("session-coordinator".into())
            .spawn(move || coordinator.run(workers))
            .map_err(|source| Error::ThreadSpawn {
                name: "session-coordinator",
                source,
            })?;

        Ok(RunningSession {
            shared,
            handle: Some(handle),
            started: Instant::now(),
        })
    }

    /// Validates `config` and sets up everything the coordinator needs.
    fn prepare(self, config: SessionConfig) -> Result<(Coordinator, Workers)> {
        config.validate()?;

        let clock = SessionClock::start();
        let shared = Arc::new(Shared {
            phase: PhaseCell::new(Phase::Idle),
            cancel: AtomicBool::new(false),
            stop_workload: AtomicBool::new(false),
            workload_aborted: AtomicBool::new(false),
            iteration_limit: AtomicBool::new(false),
            events_full: AtomicBool::new(false),
            backpressure: Backpressure::default(),
            counters: Arc::clone(&self.counters),
        });

        let metadata = SessionMetadata {
            session_id: SessionId::generate(),
            started_at: SystemTime::now(),
            sensor: self.source.name().to_string(),
            workload_backend: self.backend.name().to_string(),
            config: config.clone(),
        };

        let generator = WorkloadGenerator::configure(
            self.backend,
            &config.workload,
            GeneratorOptions {
                unit_timeout: config.workload_timeout(),
                failure_limit: config.consecutive_failure_limit,
            },
            clock,
            Arc::clone(&self.counters),
        )?;
        let source = BoundedSource::spawn(self.source, config.hardware_read_timeout())?;

        let (telemetry_writer, telemetry_reader) = append_log(config.telemetry_capacity());
        let (event_writer, event_reader) = append_log(config.event_capacity());
        let session = ActiveSession::new(metadata, clock, telemetry_reader, event_reader);

        log::info!(
            "session {} starting: sensor {}, workload {}",
            session.metadata().session_id,
            session.metadata().sensor,
            session.metadata().workload_backend
        );

        let coordinator = Coordinator {
            config,
            clock,
            shared,
            state: SessionState::Idle,
            session: Some(session),
            running_since: None,
        };
        let workers = Workers {
            source,
            generator,
            telemetry_writer,
            event_writer,
        };
        Ok((coordinator, workers))
    }
}

/// Handle to a session in progress.
pub struct RunningSession {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<Result<SessionOutcome>>>,
    started: Instant,
}

impl RunningSession {
    /// Requests a graceful stop. Returns immediately.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    /// Advisory snapshot of the session phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase.get()
    }

    #[must_use]
    pub fn throughput(&self) -> ThroughputSnapshot {
        self.shared.counters.snapshot()
    }

    /// Whether the workload is currently held back for telemetry.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.shared.backpressure.is_engaged()
    }

    #[must_use]
    pub fn backpressure_engagements(&self) -> u64 {
        self.shared.backpressure.engagements()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Blocks until the session is finalized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] if the lifecycle was violated, or
    /// [`Error::ThreadPanicked`] if the coordinator died.
    pub fn wait(mut self) -> Result<SessionOutcome> {
        let Some(handle) = self.handle.take() else {
            return Err(Error::ThreadPanicked("session-coordinator"));
        };
        handle
            .join()
            .map_err(|_| Error::ThreadPanicked("session-coordinator"))?
    }
}

impl Drop for RunningSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            let _ = handle.join();
        }
    }
}

/// Everything that moves onto the worker threads when `Running` begins.
struct Workers {
    source: BoundedSource,
    generator: WorkloadGenerator,
    telemetry_writer: LogWriter<TelemetryReading>,
    event_writer: LogWriter<WorkloadEvent>,
}

struct Running {
    sampler: Sampler,
    workload: Option<thread::JoinHandle<()>>,
}

struct Coordinator {
    config: SessionConfig,
    clock: SessionClock,
    shared: Arc<Shared>,
    state: SessionState,
    session: Option<ActiveSession>,
    running_since: Option<Instant>,
}

impl Coordinator {
    fn run(&mut self, mut workers: Workers) -> Result<SessionOutcome> {
        self.transition(Trigger::Start)?;

        if let Err(reason) = self.warm_up(&mut workers.source) {
            self.transition(Trigger::Abort(reason))?;
            return self.finish(None);
        }
        self.transition(Trigger::WarmupComplete)?;
        self.running_since = Some(Instant::now());

        let running = if self.shared.cancel.load(Ordering::Acquire) {
            // Cancelled during warm-up: no load is started.
            None
        } else {
            match self.launch(workers) {
                Ok(running) => Some(running),
                Err(e) => {
                    log::error!("failed to launch the session workers: {e}");
                    self.transition(Trigger::Abort(EndReason::WorkloadAborted))?;
                    return self.finish(None);
                }
            }
        };

        let trigger = match &running {
            Some(running) => self.monitor(running),
            None => Trigger::Stop(EndReason::Cancelled),
        };
        self.transition(trigger)?;
        self.finish(running)
    }

    /// Discards the first fresh readings. Returns the abort reason if the
    /// sensor keeps failing.
    fn warm_up(&self, source: &mut BoundedSource) -> std::result::Result<(), EndReason> {
        let wanted = self.config.warmup_readings;
        let threshold = self.config.hardware_failure_threshold;
        let mut discarded = 0;
        let mut failures = 0;

        while discarded < wanted {
            if self.shared.cancel.load(Ordering::Acquire) {
                log::info!("cancelled during warm-up");
                return Ok(());
            }
            match source.read() {
                Ok(read) if !read.stale => {
                    discarded += 1;
                    failures = 0;
                }
                Ok(_) => {
                    failures += 1;
                    log::warn!("warm-up read timed out ({failures} in a row)");
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("warm-up read failed ({failures} in a row): {e}");
                }
            }
            if failures >= threshold {
                log::error!("sensor {} never became ready", source.name());
                return Err(EndReason::HardwareFailure);
            }
            if discarded < wanted {
                self.pause(self.config.sample_interval());
            }
        }
        log::debug!("warm-up discarded {discarded} reading(s)");
        Ok(())
    }

    /// Sleeps up to `duration`, returning early on cancel.
    fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        while !self.shared.cancel.load(Ordering::Acquire) {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(MAX_MONITOR_POLL));
        }
    }

    fn launch(&self, w: Workers) -> Result<Running> {
        let Workers {
            source,
            generator,
            telemetry_writer,
            event_writer,
        } = w;

        let sampler = Sampler::start(
            source,
            telemetry_writer,
            self.clock,
            SamplerOptions {
                interval: self.config.sample_interval(),
                failure_threshold: self.config.hardware_failure_threshold,
            },
        )?;

        let shared = Arc::clone(&self.shared);
        let max_iterations = self.config.max_iterations;
        let workload = thread::Builder::new()
            .name("workload".into())
            .spawn(move || workload_loop(generator, event_writer, &shared, max_iterations))
            .map_err(|source| Error::ThreadSpawn {
                name: "workload",
                source,
            })?;

        Ok(Running {
            sampler,
            workload: Some(workload),
        })
    }

    /// Polls until something ends the run, steering backpressure meanwhile.
    fn monitor(&self, running: &Running) -> Trigger {
        let interval = self.config.sample_interval();
        let interval_ns = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        let poll = (interval / 4).clamp(MIN_MONITOR_POLL, MAX_MONITOR_POLL);
        let started = self.running_since.unwrap_or_else(Instant::now);
        let started_ns = self.clock.ns_at(started);
        let status = running.sampler.status();
        let mut seen_skips = 0;

        loop {
            // Sampled first: a loop that ended itself raised its flag before
            // exiting.
            let workload_done = running.workload.as_ref().is_none_or(|h| h.is_finished());

            if self.shared.workload_aborted.load(Ordering::Acquire) {
                return Trigger::Abort(EndReason::WorkloadAborted);
            }
            if status.hardware_failed() {
                log::error!(
                    "sensor failed {} reads in a row",
                    status.consecutive_failures()
                );
                return Trigger::Abort(EndReason::HardwareFailure);
            }
            if let Some(limit) = self.config.temperature_limit_c
                && let Some(session) = &self.session
                && let Some(last) = session.telemetry().last()
                && !last.stale
                && last.temperature_c >= limit
            {
                log::error!(
                    "temperature {:.1} C reached the {limit:.1} C limit",
                    last.temperature_c
                );
                return Trigger::Abort(EndReason::ThermalLimit);
            }
            if self.shared.cancel.load(Ordering::Acquire) {
                return Trigger::Stop(EndReason::Cancelled);
            }
            if self.shared.iteration_limit.load(Ordering::Acquire) {
                return Trigger::Stop(EndReason::IterationLimit);
            }
            if let Some(limit) = self.config.duration()
                && started.elapsed() >= limit
            {
                return Trigger::Stop(EndReason::DurationElapsed);
            }
            if self.shared.events_full.load(Ordering::Acquire) || status.log_full() {
                return Trigger::Stop(EndReason::CapacityExhausted);
            }
            if workload_done {
                log::error!("workload thread exited on its own");
                return Trigger::Abort(EndReason::WorkloadAborted);
            }

            // Backpressure: telemetry older than 1.5 intervals, or ticks the
            // sampler had to skip, slow the workload down until a fresh
            // reading arrives.
            let now_ns = self.clock.now_ns();
            let newest_ns = status.last_timestamp_ns().unwrap_or(started_ns);
            let age_ns = now_ns.saturating_sub(newest_ns);
            let skips = status.skipped_ticks();
            let behind = age_ns > interval_ns + interval_ns / 2 || skips > seen_skips;
            seen_skips = skips;
            if behind {
                if self.shared.backpressure.engage() {
                    log::debug!("telemetry {age_ns} ns old, engaging backpressure");
                }
            } else if age_ns <= interval_ns && self.shared.backpressure.release() {
                log::debug!("telemetry caught up, releasing backpressure");
            }

            thread::sleep(poll);
        }
    }

    /// Stops both loops within the grace period and finalizes the session.
    fn finish(&mut self, running: Option<Running>) -> Result<SessionOutcome> {
        self.shared.stop_workload.store(true, Ordering::Release);
        self.shared.backpressure.release();

        let mut timed_out = false;
        if let Some(mut running) = running {
            running.sampler.signal_stop();
            let status = running.sampler.status();
            log::debug!(
                "sampler took {} reading(s), skipped {} tick(s), max gap {:?}; backpressure engaged {} time(s)",
                status.readings(),
                status.skipped_ticks(),
                status.max_gap(),
                self.shared.backpressure.engagements()
            );
            let deadline = Instant::now() + self.config.grace_timeout();
            loop {
                let workload_done = running.workload.as_ref().is_none_or(|h| h.is_finished());
                if workload_done && running.sampler.is_finished() {
                    break;
                }
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                thread::sleep(JOIN_POLL);
            }

            if timed_out {
                log::warn!(
                    "workers did not settle within {:?}; detaching them",
                    self.config.grace_timeout()
                );
                running.sampler.detach();
                running.workload = None;
            } else {
                running.sampler.stop();
                if let Some(handle) = running.workload.take()
                    && handle.join().is_err()
                {
                    log::error!("workload thread panicked");
                }
            }
        }

        self.transition(Trigger::Settled { timed_out })?;
        let SessionState::Finalized { reason, degraded } = self.state else {
            return Err(Error::IllegalTransition {
                from: self.state.phase(),
                trigger: "finalize",
            });
        };
        let Some(active) = self.session.take() else {
            return Err(Error::IllegalTransition {
                from: Phase::Finalized,
                trigger: "finalize",
            });
        };

        log::debug!(
            "finalizing with {} reading(s) and {} event(s)",
            active.telemetry().len(),
            active.events().len()
        );
        let session = active.finalize(reason, degraded);
        let report = report::finalize(&session);
        log::info!(
            "session {} finalized: {reason}{}",
            session.id(),
            if degraded { " (degraded)" } else { "" }
        );
        Ok(SessionOutcome { session, report })
    }

    fn transition(&mut self, trigger: Trigger) -> Result<()> {
        let next = self.state.on(trigger)?;
        log::debug!("session {} -> {}", self.state.phase(), next.phase());
        self.state = next;
        let phase = next.phase();
        // Finalized is stamped by ActiveSession::finalize itself.
        if phase != Phase::Finalized
            && let Some(session) = &mut self.session
        {
            session.record_transition(phase);
        }
        self.shared.phase.set(phase);
        Ok(())
    }
}

fn workload_loop(
    mut generator: WorkloadGenerator,
    mut events: LogWriter<WorkloadEvent>,
    shared: &Shared,
    max_iterations: Option<u64>,
) {
    let mut yielder = Yielder::new();
    log::debug!("workload loop started");

    while !shared.stop_workload.load(Ordering::Acquire) {
        if yielder.throttle(&shared.backpressure, &shared.stop_workload)
            && shared.stop_workload.load(Ordering::Acquire)
        {
            break;
        }
        if max_iterations.is_some_and(|max| generator.iterations_issued() >= max) {
            shared.iteration_limit.store(true, Ordering::Release);
            break;
        }
        if events.is_full() {
            shared.events_full.store(true, Ordering::Release);
            break;
        }

        let event = generator.run_iteration();
        log::trace!("iteration {} {}", event.iteration, event.status);
        if events.push(event).is_err() {
            shared.events_full.store(true, Ordering::Release);
            break;
        }
        if generator.abort_requested() {
            log::error!(
                "workload aborting after {} consecutive failures",
                generator.counters().snapshot().consecutive_failures
            );
            shared.workload_aborted.store(true, Ordering::Release);
            break;
        }
    }

    log::debug!(
        "workload loop stopped after {} iteration(s), last completion at {} ns",
        generator.iterations_issued(),
        generator.counters().snapshot().last_completion_ns
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        BusyBackend, FailingSource, FixedSource, Script, ScriptedBackend, SleepBackend, SlowSource,
    };
    use crate::workload::UnitStatus;

    fn config(interval_ms: u64, duration_ms: u64) -> SessionConfig {
        SessionConfig {
            sample_interval_ms: interval_ms,
            duration_ms: Some(duration_ms),
            warmup_readings: 1,
            hardware_read_timeout_ms: interval_ms / 2,
            grace_timeout_ms: 1000,
            ..SessionConfig::default()
        }
    }

    fn sleeper(ms: u64) -> Box<SleepBackend> {
        Box::new(SleepBackend::new(Duration::from_millis(ms)))
    }

    #[test]
    fn invalid_config_is_rejected_before_starting() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(1));
        let bad = SessionConfig {
            sample_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(sync.start(bad), Err(Error::ConfigurationInvalid(_))));
    }

    #[test]
    fn one_second_at_100ms_yields_about_ten_readings() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(2));
        let outcome = sync.start(config(100, 1000)).unwrap().wait().unwrap();

        let n = outcome.session.readings().len();
        assert!((9..=11).contains(&n), "{n} readings");
        assert_eq!(outcome.report.end_reason, EndReason::DurationElapsed);
        assert!(!outcome.report.degraded);
        assert!(outcome.session.went_through(Phase::Stopping));
        assert!(!outcome.session.went_through(Phase::Aborted));
    }

    #[test]
    fn streams_are_ordered_gapless_and_covered() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(3));
        let outcome = sync.start(config(50, 600)).unwrap().wait().unwrap();
        let session = &outcome.session;

        let readings = session.readings();
        assert!(
            readings
                .windows(2)
                .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns)
        );
        assert!(
            readings
                .windows(2)
                .all(|w| w[1].timestamp_ns - w[0].timestamp_ns <= 100_000_000),
            "telemetry gap above twice the interval"
        );
        assert_eq!(outcome.report.gap_violations, 0);

        let events = session.events();
        assert!(!events.is_empty());
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.iteration, i as u64);
        }
    }

    #[test]
    fn iteration_limit_stops_the_session() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(1));
        let config = SessionConfig {
            duration_ms: None,
            max_iterations: Some(25),
            ..config(20, 0)
        };
        let outcome = sync.start(config).unwrap().wait().unwrap();
        assert_eq!(outcome.report.end_reason, EndReason::IterationLimit);
        assert_eq!(outcome.report.total_iterations, 25);
        assert_eq!(outcome.report.completed, 25);
    }

    #[test]
    fn three_forced_failures_abort_with_degraded_report() {
        let script = vec![Script::Complete, Script::Fail, Script::Fail, Script::Fail];
        let sync = Synchronizer::new(
            Box::new(FixedSource::default()),
            Box::new(ScriptedBackend::new(script)),
        );
        let outcome = sync.start(config(20, 5000)).unwrap().wait().unwrap();

        assert!(outcome.session.went_through(Phase::Aborted));
        assert!(!outcome.session.went_through(Phase::Stopping));
        assert_eq!(outcome.report.end_reason, EndReason::WorkloadAborted);
        assert!(outcome.report.degraded);
        assert_eq!(outcome.report.failed, 3);
        assert_eq!(
            outcome.session.events().last().map(|e| e.status),
            Some(UnitStatus::Failed)
        );
    }

    #[test]
    fn failing_sensor_aborts_without_hanging() {
        let sync = Synchronizer::new(Box::new(FailingSource), sleeper(1));
        let config = SessionConfig {
            hardware_failure_threshold: 3,
            ..config(20, 60_000)
        };
        let grace = config.grace_timeout();
        let started = Instant::now();
        let outcome = sync.start(config).unwrap().wait().unwrap();

        // Three failed warm-up reads plus the grace period, with slack.
        assert!(started.elapsed() < Duration::from_millis(60) + grace);
        assert_eq!(outcome.report.end_reason, EndReason::HardwareFailure);
        assert!(outcome.report.degraded);
        assert!(outcome.session.went_through(Phase::Aborted));
        assert!(!outcome.session.went_through(Phase::Running));
        assert_eq!(outcome.report.readings, 0);
    }

    #[test]
    fn cancel_stops_gracefully() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(2));
        let session = sync.start(config(20, 60_000)).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(session.phase(), Phase::Running);
        assert!(session.throughput().iterations > 0);
        session.cancel();

        let outcome = session.wait().unwrap();
        assert_eq!(outcome.report.end_reason, EndReason::Cancelled);
        assert!(!outcome.report.degraded);
    }

    #[test]
    fn thermal_limit_aborts() {
        let hot = FixedSource {
            values: crate::telemetry::SensorValues {
                temperature_c: 95.0,
                ..FixedSource::default().values
            },
        };
        let sync = Synchronizer::new(Box::new(hot), sleeper(1));
        let config = SessionConfig {
            temperature_limit_c: Some(90.0),
            ..config(20, 60_000)
        };
        let outcome = sync.start(config).unwrap().wait().unwrap();
        assert_eq!(outcome.report.end_reason, EndReason::ThermalLimit);
        assert!(outcome.report.degraded);
    }

    #[test]
    fn stuck_workload_is_detached_after_grace() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(800));
        let config = SessionConfig {
            workload_timeout_ms: 5000,
            grace_timeout_ms: 100,
            ..config(20, 100)
        };
        let started = Instant::now();
        let outcome = sync.start(config).unwrap().wait().unwrap();
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(outcome.report.end_reason, EndReason::DurationElapsed);
        assert!(outcome.report.degraded);
    }

    #[test]
    fn sensor_hanging_after_warm_up_aborts() {
        let hung = SlowSource::new(vec![Duration::ZERO, Duration::ZERO, Duration::from_secs(30)]);
        let sync = Synchronizer::new(Box::new(hung), sleeper(1));
        let config = SessionConfig {
            hardware_read_timeout_ms: 10,
            hardware_failure_threshold: 3,
            ..config(20, 600)
        };
        let outcome = sync.start(config).unwrap().wait().unwrap();

        assert_eq!(outcome.report.end_reason, EndReason::HardwareFailure);
        assert!(outcome.report.degraded);
        assert!(outcome.session.went_through(Phase::Running));
        assert!(outcome.session.went_through(Phase::Aborted));
        assert!(outcome.report.stale_readings >= 3);
    }

    #[test]
    fn device_refusing_all_work_aborts() {
        let sync = Synchronizer::new(
            Box::new(FixedSource::default()),
            Box::new(BusyBackend::new(Duration::from_millis(2))),
        );
        let config = SessionConfig {
            workload_timeout_ms: 20,
            ..config(20, 5000)
        };
        let started = Instant::now();
        let outcome = sync.start(config).unwrap().wait().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.report.end_reason, EndReason::WorkloadAborted);
        assert!(outcome.report.degraded);
        assert_eq!(outcome.report.completed, 0);
        assert_eq!(outcome.report.failed, 3);
        assert!(outcome.report.skipped > 0);
    }

    #[test]
    fn lagging_telemetry_engages_then_releases_backpressure() {
        // Warm-up, one prompt tick, then a read that overruns four ticks.
        let lagging = SlowSource::new(vec![
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(120),
        ]);
        let sync = Synchronizer::new(Box::new(lagging), sleeper(2));
        let config = SessionConfig {
            hardware_read_timeout_ms: 500,
            ..config(30, 700)
        };
        let session = sync.start(config).unwrap();

        thread::sleep(Duration::from_millis(350));
        assert!(session.backpressure_engagements() > 0);
        assert!(!session.is_throttled());
        let before = session.throughput().iterations;
        thread::sleep(Duration::from_millis(100));
        assert!(session.throughput().iterations > before);

        let outcome = session.wait().unwrap();
        assert_eq!(outcome.report.end_reason, EndReason::DurationElapsed);
        assert!(!outcome.report.degraded);
    }

    #[test]
    fn worker_launch_failure_still_finalizes() {
        let sync = Synchronizer::new(Box::new(FixedSource::default()), sleeper(1));
        let (mut coordinator, workers) = sync.prepare(config(20, 1000)).unwrap();
        // Rejected by the sampler, so launching the workers fails.
        coordinator.config.sample_interval_ms = 0;

        let outcome = coordinator.run(workers).unwrap();
        assert_eq!(outcome.report.end_reason, EndReason::WorkloadAborted);
        assert!(outcome.report.degraded);
        assert!(outcome.session.went_through(Phase::Running));
        assert!(outcome.session.went_through(Phase::Aborted));
        assert_eq!(outcome.report.total_iterations, 0);
    }
}
