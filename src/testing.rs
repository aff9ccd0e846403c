// SPDX-License-Identifier: MIT
//! Scripted sensors and workload backends for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::telemetry::{SensorValues, TelemetrySource};
use crate::workload::{Dispatch, WorkUnit, WorkloadBackend, WorkloadSpec};

static HARDWARE: Mutex<()> = Mutex::new(());

/// Serializes tests that touch the process-wide sensor handle.
#[must_use]
pub fn hardware_lock() -> MutexGuard<'static, ()> {
    HARDWARE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Always returns the same values.
pub struct FixedSource {
    pub values: SensorValues,
}

impl Default for FixedSource {
    fn default() -> Self {
        Self {
            values: SensorValues {
                utilization_pct: 97.0,
                temperature_c: 64.0,
                clock_mhz: 1800.0,
                power_w: 180.0,
                memory_used_mb: 2048.0,
            },
        }
    }
}

impl TelemetrySource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    fn read(&mut self) -> Result<SensorValues> {
        Ok(self.values)
    }
}

/// Never produces a reading.
pub struct FailingSource;

impl TelemetrySource for FailingSource {
    fn name(&self) -> &str {
        "failing"
    }

    fn read(&mut self) -> Result<SensorValues> {
        Err(Error::HardwareUnavailable("no device".into()))
    }
}

/// Sleeps for the next scripted delay on each read, then answers instantly
/// once the script runs out.
pub struct SlowSource {
    delays: VecDeque<Duration>,
    inner: FixedSource,
}

impl SlowSource {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays: delays.into(),
            inner: FixedSource::default(),
        }
    }
}

impl TelemetrySource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    fn read(&mut self) -> Result<SensorValues> {
        if let Some(delay) = self.delays.pop_front() {
            thread::sleep(delay);
        }
        self.inner.read()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Script {
    Complete,
    Fail,
    Busy,
}

/// Plays back a fixed sequence of unit outcomes, then completes every unit.
pub struct ScriptedBackend {
    script: VecDeque<Script>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl WorkloadBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn prepare(&mut self, _spec: &WorkloadSpec) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, unit: WorkUnit, timeout: Duration) -> Result<Dispatch> {
        match self.script.pop_front().unwrap_or(Script::Complete) {
            Script::Complete => Ok(Dispatch::Completed),
            Script::Busy => Ok(Dispatch::Busy),
            Script::Fail => Err(Error::WorkloadTimeout {
                iteration: unit.iteration,
                timeout,
            }),
        }
    }
}

/// Completes every unit after a fixed delay, ignoring the timeout.
pub struct SleepBackend {
    delay: Duration,
}

impl SleepBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl WorkloadBackend for SleepBackend {
    fn name(&self) -> &str {
        "sleep"
    }

    fn prepare(&mut self, _spec: &WorkloadSpec) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, _unit: WorkUnit, _timeout: Duration) -> Result<Dispatch> {
        thread::sleep(self.delay);
        Ok(Dispatch::Completed)
    }
}

/// Refuses every unit after a short delay, like a device stuck on earlier
/// work.
pub struct BusyBackend {
    delay: Duration,
}

impl BusyBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl WorkloadBackend for BusyBackend {
    fn name(&self) -> &str {
        "busy"
    }

    fn prepare(&mut self, _spec: &WorkloadSpec) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, _unit: WorkUnit, _timeout: Duration) -> Result<Dispatch> {
        thread::sleep(self.delay);
        Ok(Dispatch::Busy)
    }
}
