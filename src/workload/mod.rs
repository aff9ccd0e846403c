// SPDX-License-Identifier: MIT
pub mod counters;
pub mod device;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use self::counters::ThroughputCounters;
use crate::error::{Error, Result};
use crate::session::SessionClock;

const MAX_WORK_SIZE: u32 = 1 << 26;
const MAX_PASSES: u32 = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Arithmetic passes over a float buffer.
    #[default]
    Compute,
    /// Shading passes over a framebuffer.
    Render,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Render => write!(f, "render"),
        }
    }
}

/// Shape of the GPU work issued by one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadSpec {
    pub kind: WorkloadKind,
    /// Elements (compute) or pixels (render) touched per pass.
    pub work_size: u32,
    pub passes: u32,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Compute,
            work_size: 1 << 20,
            passes: 4,
        }
    }
}

impl WorkloadSpec {
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] for an empty or oversized
    /// workload.
    pub fn validate(&self) -> Result<()> {
        if self.work_size == 0 || self.work_size > MAX_WORK_SIZE {
            return Err(Error::invalid(format!(
                "work size {} is outside 1..={MAX_WORK_SIZE}",
                self.work_size
            )));
        }
        if self.passes == 0 || self.passes > MAX_PASSES {
            return Err(Error::invalid(format!(
                "passes {} is outside 1..={MAX_PASSES}",
                self.passes
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Completed,
    /// The unit could not be issued because the device was still busy.
    Skipped,
    /// Timed out or reported an error.
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEvent {
    /// Session-clock time at which the unit settled.
    pub timestamp_ns: u64,
    pub iteration: u64,
    pub duration_ns: u64,
    pub status: UnitStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    pub iteration: u64,
    pub passes: u32,
}

/// What happened to a unit the device accepted or refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Completed,
    /// The device did not accept the unit in time.
    Busy,
}

/// A device that executes work units.
pub trait WorkloadBackend: Send {
    fn name(&self) -> &str;

    /// Allocates everything the backend needs for `spec`. Called once before
    /// the first unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be set up for this workload.
    fn prepare(&mut self, spec: &WorkloadSpec) -> Result<()>;

    /// Issues `unit` and blocks until the device reports completion or
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`Error::WorkloadTimeout`] when completion is not confirmed in time,
    /// [`Error::WorkloadAbort`] when the device is gone.
    fn execute(&mut self, unit: WorkUnit, timeout: Duration) -> Result<Dispatch>;
}

#[derive(Clone, Copy, Debug)]
pub struct GeneratorOptions {
    pub unit_timeout: Duration,
    pub failure_limit: u32,
}

/// Issues work units one at a time and turns each into a [`WorkloadEvent`].
pub struct WorkloadGenerator {
    backend: Box<dyn WorkloadBackend>,
    spec: WorkloadSpec,
    options: GeneratorOptions,
    clock: SessionClock,
    counters: Arc<ThroughputCounters>,
    next_iteration: u64,
    consecutive_failures: u32,
    /// Start of the current run of refused submissions.
    busy_since: Option<Instant>,
}

impl WorkloadGenerator {
    /// Validates `spec` and prepares the backend for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] for a bad spec, or whatever the
    /// backend reports while preparing.
    pub fn configure(
        mut backend: Box<dyn WorkloadBackend>,
        spec: &WorkloadSpec,
        options: GeneratorOptions,
        clock: SessionClock,
        counters: Arc<ThroughputCounters>,
    ) -> Result<Self> {
        spec.validate()?;
        backend.prepare(spec)?;
        log::debug!(
            "workload configured: {} {} x{} on {}",
            spec.kind,
            spec.work_size,
            spec.passes,
            backend.name()
        );
        Ok(Self {
            backend,
            spec: spec.clone(),
            options,
            clock,
            counters,
            next_iteration: 0,
            consecutive_failures: 0,
            busy_since: None,
        })
    }

    /// Runs one unit to completion, timeout, or refusal.
    ///
    /// A refused unit is `Skipped` while the device has been refusing work
    /// for less than the unit timeout. Once it has refused for a full unit
    /// timeout it is treated like a unit that timed out.
    pub fn run_iteration(&mut self) -> WorkloadEvent {
        let iteration = self.next_iteration;
        self.next_iteration += 1;

        let unit = WorkUnit {
            iteration,
            passes: self.spec.passes,
        };
        let started = Instant::now();
        let result = self.backend.execute(unit, self.options.unit_timeout);
        let finished = Instant::now();

        let timeout = self.options.unit_timeout;
        let result = match result {
            Ok(Dispatch::Busy) => {
                let busy_since = *self.busy_since.get_or_insert(started);
                if finished.duration_since(busy_since) >= timeout {
                    self.busy_since = None;
                    Err(Error::WorkloadTimeout { iteration, timeout })
                } else {
                    Ok(Dispatch::Busy)
                }
            }
            other => {
                self.busy_since = None;
                other
            }
        };

        let status = match result {
            Ok(Dispatch::Completed) => {
                self.consecutive_failures = 0;
                UnitStatus::Completed
            }
            Ok(Dispatch::Busy) => UnitStatus::Skipped,
            Err(e) => {
                self.consecutive_failures += 1;
                log::warn!(
                    "{e} ({} consecutive failure(s))",
                    self.consecutive_failures
                );
                UnitStatus::Failed
            }
        };

        let duration_ns = if status == UnitStatus::Skipped {
            0
        } else {
            u64::try_from(finished.duration_since(started).as_nanos()).unwrap_or(u64::MAX)
        };

        let event = WorkloadEvent {
            timestamp_ns: self.clock.ns_at(finished),
            iteration,
            duration_ns,
            status,
        };
        self.counters.record(&event, self.consecutive_failures);
        event
    }

    /// Set once the consecutive-failure limit is reached.
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.consecutive_failures >= self.options.failure_limit
    }

    #[must_use]
    pub fn iterations_issued(&self) -> u64 {
        self.next_iteration
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<ThroughputCounters> {
        &self.counters
    }
}
