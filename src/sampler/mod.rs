// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::session::SessionClock;
use crate::session::arena::LogWriter;
use crate::telemetry::{BoundedSource, TelemetryReading};

/// Longest uninterrupted sleep, so a stop request is seen promptly.
const STOP_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug)]
pub struct SamplerOptions {
    pub interval: Duration,
    /// Consecutive failed reads after which the hardware is given up on.
    pub failure_threshold: u32,
}

/// Progress published by the sampler thread. Everything here is advisory.
#[derive(Debug, Default)]
pub struct SamplerStatus {
    readings: AtomicU64,
    skipped_ticks: AtomicU64,
    max_gap_ns: AtomicU64,
    last_timestamp_ns: AtomicU64,
    consecutive_failures: AtomicU32,
    hardware_failed: AtomicBool,
    log_full: AtomicBool,
}

impl SamplerStatus {
    #[must_use]
    pub fn readings(&self) -> u64 {
        self.readings.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_gap(&self) -> Duration {
        Duration::from_nanos(self.max_gap_ns.load(Ordering::Relaxed))
    }

    /// Session-clock timestamp of the newest reading, if there is one.
    #[must_use]
    pub fn last_timestamp_ns(&self) -> Option<u64> {
        (self.readings() > 0).then(|| self.last_timestamp_ns.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn hardware_failed(&self) -> bool {
        self.hardware_failed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn log_full(&self) -> bool {
        self.log_full.load(Ordering::Acquire)
    }
}

/// Fixed-cadence telemetry sampler. Sole writer of the telemetry log.
pub struct Sampler {
    status: Arc<SamplerStatus>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sampler {
    /// Spawns the `telemetry-sampler` thread. The first tick fires
    /// immediately; tick `k` is due at `start + k * interval`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] for a zero interval, or
    /// [`Error::ThreadSpawn`] if the thread cannot be created.
    pub fn start(
        source: BoundedSource,
        writer: LogWriter<TelemetryReading>,
        clock: SessionClock,
        options: SamplerOptions,
    ) -> Result<Self> {
        if options.interval.is_zero() {
            return Err(Error::invalid("sample interval must be greater than zero"));
        }

        let status = Arc::new(SamplerStatus::default());
        let stop = Arc::new(AtomicBool::new(false));

        let mut worker = Worker {
            source,
            writer,
            clock,
            options,
            status: Arc::clone(&status),
            stop: Arc::clone(&stop),
        };

        let handle = thread::Builder::new()
            .name("telemetry-sampler".into())
            .spawn(move || worker.run())
            .map_err(|source| Error::ThreadSpawn {
                name: "telemetry-sampler",
                source,
            })?;

        Ok(Self {
            status,
            stop,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn status(&self) -> &Arc<SamplerStatus> {
        &self.status
    }

    /// Asks the thread to exit after its current tick without waiting.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signals the thread and joins it.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Gives up on a thread that did not stop in time. It keeps running
    /// until its current read returns, then sees the stop flag and exits.
    pub fn detach(&mut self) {
        self.signal_stop();
        self.handle = None;
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    source: BoundedSource,
    writer: LogWriter<TelemetryReading>,
    clock: SessionClock,
    options: SamplerOptions,
    status: Arc<SamplerStatus>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(&mut self) {
        let schedule_start = Instant::now();
        let interval_ns = u64::try_from(self.options.interval.as_nanos()).unwrap_or(u64::MAX);
        let mut tick: u64 = 0;

        log::debug!(
            "sampler started: {} every {:?}",
            self.source.name(),
            self.options.interval
        );

        loop {
            let due = schedule_start + Duration::from_nanos(interval_ns.saturating_mul(tick));
            if !self.sleep_until(due) {
                break;
            }
            if !self.sample_once() {
                break;
            }

            // The next tick is the first one still in the future; any in
            // between were overrun by this read and are dropped.
            let elapsed_ns =
                u64::try_from(schedule_start.elapsed().as_nanos()).unwrap_or(u64::MAX);
            let next = (elapsed_ns / interval_ns + 1).max(tick + 1);
            let skipped = next - tick - 1;
            if skipped > 0 {
                self.status
                    .skipped_ticks
                    .fetch_add(skipped, Ordering::Relaxed);
                log::debug!("sampler overran {skipped} tick(s) after tick {tick}");
            }
            tick = next;
        }

        log::debug!(
            "sampler stopped after {} reading(s), {} skipped tick(s)",
            self.status.readings(),
            self.status.skipped_ticks()
        );
    }

    /// Returns `false` if a stop was requested before `due`.
    fn sleep_until(&self, due: Instant) -> bool {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let remaining = due.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(STOP_POLL));
        }
    }

    /// Takes and appends one reading. Returns `false` once the log is full.
    ///
    /// A read that fails or times out still appends a reading, carrying the
    /// previous values flagged stale, and extends the failure streak.
    fn sample_once(&mut self) -> bool {
        let (values, stale) = match self.source.read() {
            Ok(read) if !read.stale => {
                self.status.consecutive_failures.store(0, Ordering::Relaxed);
                (read.values, false)
            }
            Ok(read) => {
                self.record_failure(&format!("no answer within {:?}", self.source.timeout()));
                (read.values, true)
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                (self.source.previous().unwrap_or_default(), true)
            }
        };

        let previous_ts = self.writer.last().map(|r| r.timestamp_ns);
        let timestamp_ns = self.clock.now_ns().max(previous_ts.unwrap_or(0));
        let reading = TelemetryReading::new(timestamp_ns, values, stale);

        if self.writer.push(reading).is_err() {
            log::warn!("telemetry log full after {} reading(s)", self.writer.len());
            self.status.log_full.store(true, Ordering::Release);
            return false;
        }
        log::trace!("reading at {timestamp_ns} ns (stale: {stale})");

        if let Some(prev) = previous_ts {
            self.status
                .max_gap_ns
                .fetch_max(timestamp_ns - prev, Ordering::Relaxed);
        }
        self.status
            .last_timestamp_ns
            .store(timestamp_ns, Ordering::Relaxed);
        self.status.readings.fetch_add(1, Ordering::Release);
        true
    }

    fn record_failure(&self, cause: &str) {
        let failures = self
            .status
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        log::warn!("telemetry read failed ({failures} in a row): {cause}");
        if failures >= self.options.failure_threshold
            && !self.status.hardware_failed.swap(true, Ordering::AcqRel)
        {
            log::error!("{} failed {failures} times in a row", self.source.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::arena::{LogReader, append_log};
    use crate::testing::{FailingSource, FixedSource, SlowSource};
    use crate::telemetry::TelemetrySource;

    fn start(
        source: Box<dyn TelemetrySource>,
        interval: Duration,
        capacity: usize,
    ) -> (Sampler, LogReader<TelemetryReading>) {
        let bounded = BoundedSource::spawn(source, Duration::from_millis(500)).unwrap();
        let (writer, reader) = append_log(capacity);
        let sampler = Sampler::start(
            bounded,
            writer,
            SessionClock::start(),
            SamplerOptions {
                interval,
                failure_threshold: 3,
            },
        )
        .unwrap();
        (sampler, reader)
    }

    #[test]
    fn samples_at_a_fixed_cadence() {
        let (mut sampler, reader) =
            start(Box::new(FixedSource::default()), Duration::from_millis(20), 64);
        thread::sleep(Duration::from_millis(210));
        sampler.stop();

        let readings = reader.snapshot();
        assert!((9..=13).contains(&readings.len()), "{} readings", readings.len());
        assert!(readings.iter().all(|r| !r.stale));
        assert!(
            readings
                .windows(2)
                .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns)
        );
        assert_eq!(sampler.status().readings(), readings.len() as u64);
    }

    #[test]
    fn overrunning_read_skips_ticks_instead_of_backlogging() {
        let slow = SlowSource::new(vec![Duration::ZERO, Duration::from_millis(120)]);
        let (mut sampler, reader) = start(Box::new(slow), Duration::from_millis(30), 64);
        thread::sleep(Duration::from_millis(250));
        sampler.stop();

        assert!(sampler.status().skipped_ticks() >= 2);
        // No burst of back-to-back readings after the slow one.
        let readings = reader.snapshot();
        let tight = readings
            .windows(2)
            .filter(|w| w[1].timestamp_ns - w[0].timestamp_ns < 5_000_000)
            .count();
        assert_eq!(tight, 0);
    }

    #[test]
    fn repeated_failures_raise_hardware_flag_with_stale_readings() {
        let (mut sampler, reader) = start(Box::new(FailingSource), Duration::from_millis(10), 64);
        thread::sleep(Duration::from_millis(80));
        sampler.stop();

        assert!(sampler.status().hardware_failed());
        assert!(sampler.status().consecutive_failures() >= 3);
        let readings = reader.snapshot();
        assert!(!readings.is_empty());
        assert!(readings.iter().all(|r| r.stale));
    }

    #[test]
    fn hung_sensor_counts_as_failing() {
        let hung = SlowSource::new(vec![Duration::ZERO, Duration::from_secs(30)]);
        let bounded = BoundedSource::spawn(Box::new(hung), Duration::from_millis(5)).unwrap();
        let (writer, reader) = append_log(64);
        let mut sampler = Sampler::start(
            bounded,
            writer,
            SessionClock::start(),
            SamplerOptions {
                interval: Duration::from_millis(10),
                failure_threshold: 3,
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        sampler.stop();

        assert!(sampler.status().hardware_failed());
        let readings = reader.snapshot();
        assert!(!readings[0].stale);
        assert!(readings[1..].iter().all(|r| r.stale));
        assert!((readings[1].temperature_c - readings[0].temperature_c).abs() < f32::EPSILON);
    }

    #[test]
    fn full_log_stops_the_sampler() {
        let (mut sampler, reader) =
            start(Box::new(FixedSource::default()), Duration::from_millis(5), 3);
        thread::sleep(Duration::from_millis(100));
        assert!(sampler.is_finished());
        assert!(sampler.status().log_full());
        assert_eq!(reader.len(), 3);
        sampler.stop();
    }

    #[test]
    fn stop_is_prompt_with_a_long_interval() {
        let (mut sampler, _reader) =
            start(Box::new(FixedSource::default()), Duration::from_secs(30), 4);
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        sampler.stop();
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
