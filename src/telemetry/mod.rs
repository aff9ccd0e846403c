// SPDX-License-Identifier: MIT
pub mod hardware;
pub mod nvidia_smi;
pub mod simulated;

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Instantaneous sensor values as reported by a backend. A metric the device
/// does not report is NaN.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorValues {
    pub utilization_pct: f32,
    pub temperature_c: f32,
    pub clock_mhz: f32,
    pub power_w: f32,
    pub memory_used_mb: f32,
}

/// One timestamped sample in a session's telemetry log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Monotonic nanoseconds since the session epoch.
    pub timestamp_ns: u64,
    pub utilization_pct: f32,
    pub temperature_c: f32,
    pub clock_mhz: f32,
    pub power_w: f32,
    pub memory_used_mb: f32,
    /// Values were carried over from the previous reading.
    pub stale: bool,
}

impl TelemetryReading {
    #[must_use]
    pub fn new(timestamp_ns: u64, values: SensorValues, stale: bool) -> Self {
        Self {
            timestamp_ns,
            utilization_pct: values.utilization_pct,
            temperature_c: values.temperature_c,
            clock_mhz: values.clock_mhz,
            power_w: values.power_w,
            memory_used_mb: values.memory_used_mb,
            stale,
        }
    }
}

/// A hardware sensor backend. Implementations may block; callers that need a
/// bound wrap them in [`BoundedSource`].
pub trait TelemetrySource: Send {
    fn name(&self) -> &str;

    /// Reads the current sensor values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if the device cannot be read.
    fn read(&mut self) -> Result<SensorValues>;
}

/// Result of a bounded read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundedRead {
    pub values: SensorValues,
    pub stale: bool,
}

struct Request {
    seq: u64,
}

struct Response {
    seq: u64,
    result: Result<SensorValues>,
}

/// Runs a [`TelemetrySource`] on a `sensor-io` thread so that no read blocks
/// the caller for longer than `timeout`.
pub struct BoundedSource {
    name: String,
    requests: Sender<Request>,
    responses: Receiver<Response>,
    timeout: Duration,
    next_seq: u64,
    previous: Option<SensorValues>,
}

impl BoundedSource {
    /// Moves `source` onto its own I/O thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadSpawn`] if the thread cannot be created.
    pub fn spawn(mut source: Box<dyn TelemetrySource>, timeout: Duration) -> Result<Self> {
        let name = source.name().to_string();
        // Capacity 1: a request can only be queued while the worker is idle,
        // so a hung read never builds a backlog behind it.
        let (requests, request_rx) = crossbeam_channel::bounded::<Request>(1);
        let (response_tx, responses) = crossbeam_channel::unbounded::<Response>();

        thread::Builder::new()
            .name("sensor-io".into())
            .spawn(move || {
                while let Ok(Request { seq }) = request_rx.recv() {
                    let result = source.read();
                    if response_tx.send(Response { seq, result }).is_err() {
                        break;
                    }
                }
                log::debug!("sensor-io thread for {} exiting", source.name());
            })
            .map_err(|source| Error::ThreadSpawn {
                name: "sensor-io",
                source,
            })?;

        Ok(Self {
            name,
            requests,
            responses,
            timeout,
            next_seq: 0,
            previous: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads the source, waiting at most the configured timeout.
    ///
    /// A read that times out (or cannot be issued because an earlier one is
    /// still in flight) yields the previous values flagged stale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] when the backend reports a
    /// failure or its thread is gone.
    pub fn read(&mut self) -> Result<BoundedRead> {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.requests.try_send(Request { seq }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Ok(self.stale_read()),
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::HardwareUnavailable(format!(
                    "{} worker thread is gone",
                    self.name
                )));
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.seq == seq => {
                    let values = response.result?;
                    self.previous = Some(values);
                    return Ok(BoundedRead {
                        values,
                        stale: false,
                    });
                }
                // Answer to a request that already timed out.
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!("{} read {seq} timed out after {:?}", self.name, self.timeout);
                    return Ok(self.stale_read());
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::HardwareUnavailable(format!(
                        "{} worker thread is gone",
                        self.name
                    )));
                }
            }
        }
    }

    /// The last fresh values, if any read ever succeeded.
    #[must_use]
    pub fn previous(&self) -> Option<SensorValues> {
        self.previous
    }

    fn stale_read(&self) -> BoundedRead {
        BoundedRead {
            values: self.previous.unwrap_or_default(),
            stale: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingSource, FixedSource, SlowSource};

    #[test]
    fn fresh_read_passes_values_through() {
        let mut source =
            BoundedSource::spawn(Box::new(FixedSource::default()), Duration::from_secs(1))
                .unwrap();
        let read = source.read().unwrap();
        assert!(!read.stale);
        assert_eq!(read.values, FixedSource::default().values);
        assert_eq!(source.previous(), Some(read.values));
    }

    #[test]
    fn backend_failure_is_hardware_unavailable() {
        let mut source =
            BoundedSource::spawn(Box::new(FailingSource), Duration::from_secs(1)).unwrap();
        assert!(matches!(source.read(), Err(Error::HardwareUnavailable(_))));
        assert!(source.previous().is_none());
    }

    #[test]
    fn slow_read_returns_stale_previous_values_within_timeout() {
        let slow = SlowSource::new(vec![Duration::ZERO, Duration::from_millis(400)]);
        let mut source =
            BoundedSource::spawn(Box::new(slow), Duration::from_millis(50)).unwrap();

        let first = source.read().unwrap();
        assert!(!first.stale);

        let started = Instant::now();
        let second = source.read().unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(second.stale);
        assert_eq!(second.values, first.values);

        // The worker is still stuck in the slow read.
        let third = source.read().unwrap();
        assert!(third.stale);
    }
}
